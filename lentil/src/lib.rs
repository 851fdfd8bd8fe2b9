pub mod arborescence;
pub mod cell_types;
pub mod common;
pub mod config;
pub mod decoder;
pub mod graph_prune;
pub mod init_params;
pub mod input;
pub mod kinetics;
pub mod knn_transition;
pub mod lineage_partition;
pub mod output;
pub mod run_fit;
pub mod trainer;
pub mod transition_graph;
pub mod velocity;
