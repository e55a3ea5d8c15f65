use crate::shape::Shape;

// Value — Host-side nested values
//
// The evaluator's inputs (constant literals, placeholder feeds, variable
// initializers) and outputs (the result of `run`) are nested sequences of
// native numbers. A scalar is `Num`; everything else nests `List`s to the
// tensor's rank. Numbers are carried as f64, which represents every int32
// and bool exactly.

/// A nested host value: a scalar number or a list of values.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Num(f64),
    List(Vec<Value>),
}

impl Value {
    /// Flatten into a contiguous row-major vector.
    pub fn flatten(&self) -> Vec<f64> {
        let mut out = Vec::new();
        self.flatten_into(&mut out);
        out
    }

    fn flatten_into(&self, out: &mut Vec<f64>) {
        match self {
            Value::Num(v) => out.push(*v),
            Value::List(items) => {
                for item in items {
                    item.flatten_into(out);
                }
            }
        }
    }

    /// The shape implied by the nesting structure. Assumes rectangular
    /// nesting; ragged inputs take the first child's extent per level.
    pub fn shape(&self) -> Shape {
        let mut dims = Vec::new();
        let mut cur = self;
        loop {
            match cur {
                Value::Num(_) => break,
                Value::List(items) => {
                    dims.push(items.len());
                    match items.first() {
                        Some(first) => cur = first,
                        None => break,
                    }
                }
            }
        }
        Shape::new(dims)
    }

    /// True for an empty list; empty values skip the device write path.
    pub fn is_empty(&self) -> bool {
        matches!(self, Value::List(items) if items.is_empty())
    }

    /// Rebuild a nested value from a flat row-major slice and a shape.
    /// A rank-0 shape yields `Num(flat[0])`.
    pub fn from_flat(flat: &[f64], shape: &Shape) -> Value {
        fn build(flat: &[f64], dims: &[usize]) -> Value {
            match dims.split_first() {
                None => Value::Num(flat.first().copied().unwrap_or(0.0)),
                Some((&d0, rest)) => {
                    let chunk = rest.iter().product::<usize>().max(1);
                    let items = (0..d0)
                        .map(|i| build(&flat[i * chunk..(i + 1) * chunk], rest))
                        .collect();
                    Value::List(items)
                }
            }
        }
        build(flat, shape.dims())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Num(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Num(v as f64)
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Value::List(v.into_iter().map(Value::Num).collect())
    }
}

impl From<Vec<Vec<f64>>> for Value {
    fn from(v: Vec<Vec<f64>>) -> Self {
        Value::List(v.into_iter().map(Value::from).collect())
    }
}

impl From<&[f64]> for Value {
    fn from(v: &[f64]) -> Self {
        Value::List(v.iter().map(|&x| Value::Num(x)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flatten_and_shape() {
        let v = Value::from(vec![vec![1.0, 2.0], vec![3.0, 4.0]]);
        assert_eq!(v.shape(), Shape::from((2, 2)));
        assert_eq!(v.flatten(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_scalar() {
        let v = Value::Num(7.0);
        assert_eq!(v.shape(), Shape::scalar());
        assert_eq!(v.flatten(), vec![7.0]);
    }

    #[test]
    fn test_from_flat_round_trip() {
        let shape = Shape::from((3, 2));
        let flat = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let v = Value::from_flat(&flat, &shape);
        assert_eq!(v.shape(), shape);
        assert_eq!(v.flatten(), flat.to_vec());
    }

    #[test]
    fn test_from_flat_scalar() {
        let v = Value::from_flat(&[42.0], &Shape::scalar());
        assert_eq!(v, Value::Num(42.0));
    }
}
