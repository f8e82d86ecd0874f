use parking_lot::RwLock;

use crate::core::types::RowId;

/// Builder interface the accumulator and mergers feed columnar values
/// through; one builder per columnar attribute
pub trait ColumnarBuilder: Send {
    fn push(&mut self, value: u64);

    fn finish(self: Box<Self>) -> SimpleColumnar;
}

/// In-memory reference implementation of a per-segment column. Values are
/// updatable in place (the update engine delegates to `set`).
#[derive(Debug)]
pub struct SimpleColumnar {
    values: RwLock<Vec<u64>>,
}

impl SimpleColumnar {
    pub fn from_values(values: Vec<u64>) -> Self {
        SimpleColumnar {
            values: RwLock::new(values),
        }
    }

    pub fn len(&self) -> u32 {
        self.values.read().len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }

    pub fn get(&self, row_id: RowId) -> u64 {
        self.values.read()[row_id as usize]
    }

    /// In-place update; false if the row is out of range
    pub fn set(&self, row_id: RowId, value: u64) -> bool {
        let mut values = self.values.write();
        match values.get_mut(row_id as usize) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn to_values(&self) -> Vec<u64> {
        self.values.read().clone()
    }

    pub fn memory_bytes(&self) -> usize {
        self.values.read().len() * 8
    }
}

#[derive(Debug, Default)]
pub struct SimpleColumnarBuilder {
    values: Vec<u64>,
}

impl SimpleColumnarBuilder {
    pub fn new() -> Self {
        SimpleColumnarBuilder { values: Vec::new() }
    }
}

impl ColumnarBuilder for SimpleColumnarBuilder {
    fn push(&mut self, value: u64) {
        self.values.push(value);
    }

    fn finish(self: Box<Self>) -> SimpleColumnar {
        SimpleColumnar::from_values(self.values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_update() {
        let mut builder = Box::new(SimpleColumnarBuilder::new());
        builder.push(10);
        builder.push(20);
        let column = builder.finish();

        assert_eq!(column.len(), 2);
        assert_eq!(column.get(1), 20);
        assert!(column.set(1, 99));
        assert_eq!(column.get(1), 99);
        assert!(!column.set(5, 1));
    }
}
