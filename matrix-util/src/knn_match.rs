use rayon::prelude::*;
use std::collections::HashMap;
use std::fmt::{Debug, Display};

/// A dictionary (HnswMap wrapper) for fast column look-up
///
pub struct ColumnDict<T> {
    pub dict: instant_distance::HnswMap<VecPoint, T>,
    pub data_vec: Vec<VecPoint>,
    pub name2index: HashMap<T, usize>,
}

impl<T> ColumnDict<T>
where
    T: Clone + Eq + std::hash::Hash + Debug + Display + Send + Sync,
{
    pub fn names(&self) -> &Vec<T> {
        &self.dict.values
    }

    pub fn len(&self) -> usize {
        self.data_vec.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data_vec.is_empty()
    }

    /// Build a dictionary over column views
    ///
    /// * `data` - one view per point
    /// * `names` - one name per point
    pub fn from_dvector_views(data: Vec<nalgebra::DVectorView<f32>>, names: Vec<T>) -> Self {
        debug_assert!(
            data.len() == names.len(),
            "Data and names must have the same length"
        );

        let data_vec: Vec<VecPoint> = data.par_iter().map(|x| x.to_vp()).collect();

        let name2index = names
            .iter()
            .enumerate()
            .map(|(j, x)| (x.clone(), j))
            .collect::<HashMap<T, usize>>();

        use instant_distance::Builder;
        let dict = Builder::default().build(data_vec.clone(), names);

        ColumnDict {
            dict,
            data_vec,
            name2index,
        }
    }

    /// k-nearest neighbours of a named point among all the other
    /// points of this dictionary.
    ///
    /// * `query_name` - the name of the point
    /// * `knn` - the number of neighbours (the point itself excluded)
    ///
    /// Returns `(names, distances)` in increasing distance.
    pub fn search_others(&self, query_name: &T, knn: usize) -> anyhow::Result<(Vec<T>, Vec<f32>)> {
        use instant_distance::Search;

        let self_idx = self
            .name2index
            .get(query_name)
            .ok_or(anyhow::anyhow!("name {} not found", query_name))?;

        let query = &self.data_vec[*self_idx];
        let mut search = Search::default();

        let mut names = Vec::with_capacity(knn);
        let mut distances = Vec::with_capacity(knn);

        for item in self.dict.search(query, &mut search) {
            if item.value == query_name {
                continue;
            }
            names.push(item.value.clone());
            distances.push(item.distance);
            if names.len() >= knn {
                break;
            }
        }
        Ok((names, distances))
    }
}

#[derive(Clone, Debug)]
/// a wrapper for Vec<f32>
pub struct VecPoint {
    pub data: Vec<f32>,
}

pub trait MakeVecPoint {
    fn to_vp(&self) -> VecPoint;
}

impl MakeVecPoint for Vec<f32> {
    fn to_vp(&self) -> VecPoint {
        VecPoint { data: self.clone() }
    }
}

impl MakeVecPoint for nalgebra::DVectorView<'_, f32> {
    fn to_vp(&self) -> VecPoint {
        VecPoint {
            data: self.iter().cloned().collect(),
        }
    }
}

impl instant_distance::Point for VecPoint {
    fn distance(&self, other: &Self) -> f32 {
        self.data
            .iter()
            .zip(other.data.iter())
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f32>()
            .sqrt()
    }
}
