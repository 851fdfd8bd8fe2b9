use fnv::FnvHashMap as HashMap;

/// Bidirectional enumeration of cell-type labels: each distinct
/// label gets a dense code in the order it is first seen.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CellTypes {
    names: Vec<Box<str>>,
    code_of: HashMap<Box<str>, usize>,
}

impl CellTypes {
    /// Enumerate distinct labels in first-seen order
    pub fn from_labels<S: AsRef<str>>(labels: &[S]) -> Self {
        let mut ret = Self::default();
        for x in labels {
            ret.insert(x.as_ref());
        }
        ret
    }

    /// Add a label if new, returning its code
    pub fn insert(&mut self, label: &str) -> usize {
        if let Some(&k) = self.code_of.get(label) {
            return k;
        }
        let k = self.names.len();
        let label: Box<str> = label.into();
        self.names.push(label.clone());
        self.code_of.insert(label, k);
        k
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[Box<str>] {
        &self.names
    }

    pub fn code(&self, label: &str) -> Option<usize> {
        self.code_of.get(label).copied()
    }

    pub fn name(&self, code: usize) -> Option<&str> {
        self.names.get(code).map(|x| x.as_ref())
    }

    /// Encode a label array; every label must be known
    pub fn encode<S: AsRef<str>>(&self, labels: &[S]) -> anyhow::Result<Vec<usize>> {
        labels
            .iter()
            .map(|x| {
                self.code(x.as_ref())
                    .ok_or(anyhow::anyhow!("unknown cell type `{}`", x.as_ref()))
            })
            .collect()
    }

    /// Decode a code array; every code must be in range
    pub fn decode(&self, codes: &[usize]) -> anyhow::Result<Vec<Box<str>>> {
        codes
            .iter()
            .map(|&k| {
                self.names
                    .get(k)
                    .cloned()
                    .ok_or(anyhow::anyhow!("cell type code {} out of {}", k, self.len()))
            })
            .collect()
    }
}
