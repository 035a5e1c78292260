use std::ops::Range;

use ndarray::{ArrayView, ArrayView1, ArrayView2, Dimension, Ix1, Ix2};
use serde::{Deserialize, Serialize};

use crate::error::{MlErr, Result};

/// A named tensor living inside the flat parameter buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorMeta {
    pub name: String,
    pub shape: Vec<usize>,
    pub offset: usize,
}

impl TensorMeta {
    /// The amount of scalars in this tensor.
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The range this tensor occupies in the flat buffer.
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.len()
    }

    /// Whether this tensor takes part in the norm penalty.
    ///
    /// Only tensors with a non-zero leading dimension qualify, scalars are
    /// always excluded.
    pub fn is_penalized(&self) -> bool {
        self.shape.first().is_some_and(|&d| d > 0)
    }
}

/// Maps a flat parameter buffer into named tensors.
///
/// Tensors are laid out back to back in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamLayout {
    tensors: Vec<TensorMeta>,
    total: usize,
}

impl ParamLayout {
    /// Creates a new empty `ParamLayout`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a tensor to the end of the layout.
    ///
    /// # Arguments
    /// * `name` - The unique name of the tensor.
    /// * `shape` - The dimensions of the tensor.
    ///
    /// # Returns
    /// The layout itself to keep chaining calls, or an error if the name is taken.
    pub fn push(mut self, name: impl Into<String>, shape: &[usize]) -> Result<Self> {
        let name = name.into();
        if self.get(&name).is_some() {
            return Err(MlErr::LayoutMismatch(format!("duplicated tensor {name}")));
        }

        let meta = TensorMeta {
            name,
            shape: shape.to_vec(),
            offset: self.total,
        };

        self.total += meta.len();
        self.tensors.push(meta);
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&TensorMeta> {
        self.tensors.iter().find(|t| t.name == name)
    }

    /// Same as `get` but failing on unknown names.
    pub fn meta(&self, name: &str) -> Result<&TensorMeta> {
        self.get(name)
            .ok_or_else(|| MlErr::UnknownTensor(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &TensorMeta> {
        self.tensors.iter()
    }

    /// The total amount of scalars over every tensor.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Fails unless `other` names the same tensors with the same shapes.
    pub fn ensure_matches(&self, other: &ParamLayout) -> Result<()> {
        if self.tensors.len() != other.tensors.len() {
            return Err(MlErr::LayoutMismatch(format!(
                "{} tensors against {}",
                self.tensors.len(),
                other.tensors.len()
            )));
        }

        for (a, b) in self.tensors.iter().zip(&other.tensors) {
            if a != b {
                return Err(MlErr::LayoutMismatch(format!(
                    "{} {:?} against {} {:?}",
                    a.name, a.shape, b.name, b.shape
                )));
            }
        }

        Ok(())
    }
}

/// Owns the flat parameters of a model together with its gradient buffer.
#[derive(Debug, Clone)]
pub struct ParamStore {
    layout: ParamLayout,
    params: Vec<f32>,
    grads: Vec<f32>,
}

impl ParamStore {
    /// Creates a zero initialized store for `layout`.
    pub fn zeros(layout: ParamLayout) -> Self {
        let total = layout.total();

        Self {
            layout,
            params: vec![0.; total],
            grads: vec![0.; total],
        }
    }

    /// Creates a store from already materialized parameters.
    ///
    /// # Arguments
    /// * `layout` - The tensors the parameters are made of.
    /// * `params` - The flat parameters, must hold exactly `layout.total()` values.
    ///
    /// # Returns
    /// The new store or a size mismatch error.
    pub fn from_parts(layout: ParamLayout, params: Vec<f32>) -> Result<Self> {
        if params.len() != layout.total() {
            return Err(MlErr::SizeMismatch {
                a: "params",
                b: "layout",
                got: params.len(),
                expected: layout.total(),
            });
        }

        let grads = vec![0.; params.len()];
        Ok(Self {
            layout,
            params,
            grads,
        })
    }

    pub fn layout(&self) -> &ParamLayout {
        &self.layout
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn params(&self) -> &[f32] {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut [f32] {
        &mut self.params
    }

    pub fn grads(&self) -> &[f32] {
        &self.grads
    }

    pub fn grads_mut(&mut self) -> &mut [f32] {
        &mut self.grads
    }

    /// Borrows the parameters mutably and the gradients immutably at once.
    pub fn split_mut(&mut self) -> (&mut [f32], &[f32]) {
        (&mut self.params, &self.grads)
    }

    /// Borrows the gradients mutably and the parameters immutably at once.
    pub fn grads_with_params(&mut self) -> (&mut [f32], &[f32]) {
        (&mut self.grads, &self.params)
    }

    /// Clears every accumulated gradient.
    pub fn zero_grad(&mut self) {
        self.grads.fill(0.);
    }

    /// Gives a read only view of the tensor named `name`.
    pub fn view<D: Dimension>(&self, name: &str, dim: D) -> Result<ArrayView<'_, f32, D>> {
        let meta = self.layout.meta(name)?;
        if dim.slice() != meta.shape.as_slice() {
            return Err(MlErr::SizeMismatch {
                a: "view",
                b: "tensor",
                got: dim.size(),
                expected: meta.len(),
            });
        }

        ArrayView::from_shape(dim, &self.params[meta.range()]).map_err(|e| {
            MlErr::LayoutMismatch(format!("can't view {name} as {:?}: {e}", meta.shape))
        })
    }

    pub fn view1(&self, name: &str) -> Result<ArrayView1<'_, f32>> {
        let meta = self.layout.meta(name)?;
        self.view(name, Ix1(meta.len()))
    }

    pub fn view2(&self, name: &str) -> Result<ArrayView2<'_, f32>> {
        let meta = self.layout.meta(name)?;
        let (rows, cols) = match meta.shape.as_slice() {
            &[rows, cols] => (rows, cols),
            shape => {
                return Err(MlErr::LayoutMismatch(format!(
                    "{name} has shape {shape:?}, not a matrix"
                )));
            }
        };

        self.view(name, Ix2(rows, cols))
    }

    /// Adds `grad` into the gradient slot of the tensor `name`.
    ///
    /// # Arguments
    /// * `name` - The tensor the gradient belongs to.
    /// * `grad` - A gradient with exactly the tensor's shape.
    pub fn accumulate_grad<D: Dimension>(
        &mut self,
        name: &str,
        grad: ArrayView<'_, f32, D>,
    ) -> Result<()> {
        let meta = self.layout.meta(name)?;
        if grad.shape() != meta.shape.as_slice() {
            return Err(MlErr::SizeMismatch {
                a: "gradient",
                b: "tensor",
                got: grad.len(),
                expected: meta.len(),
            });
        }

        let range = meta.range();
        for (acc, g) in self.grads[range].iter_mut().zip(grad.iter()) {
            *acc += g;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    fn layout() -> ParamLayout {
        ParamLayout::new()
            .push("w", &[2, 3])
            .unwrap()
            .push("b", &[3])
            .unwrap()
            .push("scale", &[])
            .unwrap()
            .push("empty", &[0, 4])
            .unwrap()
    }

    #[test]
    fn tensors_are_packed_back_to_back() {
        let layout = layout();

        assert_eq!(layout.total(), 10);
        assert_eq!(layout.meta("w").unwrap().range(), 0..6);
        assert_eq!(layout.meta("b").unwrap().range(), 6..9);
        assert_eq!(layout.meta("scale").unwrap().range(), 9..10);
        assert!(layout.meta("empty").unwrap().is_empty());
    }

    #[test]
    fn only_tensors_with_a_leading_dimension_are_penalized() {
        let layout = layout();
        let penalized: Vec<_> = layout
            .iter()
            .filter(|t| t.is_penalized())
            .map(|t| t.name.as_str())
            .collect();

        assert_eq!(penalized, ["w", "b"]);
    }

    #[test]
    fn duplicated_names_are_rejected() {
        let err = ParamLayout::new()
            .push("w", &[1])
            .unwrap()
            .push("w", &[2])
            .unwrap_err();

        assert!(matches!(err, MlErr::LayoutMismatch(_)));
    }

    #[test]
    fn views_follow_the_layout() {
        let params = (0..10).map(|x| x as f32).collect();
        let store = ParamStore::from_parts(layout(), params).unwrap();

        assert_eq!(
            store.view2("w").unwrap(),
            array![[0., 1., 2.], [3., 4., 5.]]
        );
        assert_eq!(store.view1("b").unwrap(), array![6., 7., 8.]);
        assert!(store.view2("b").is_err());
        assert!(matches!(
            store.view1("missing"),
            Err(MlErr::UnknownTensor(_))
        ));
    }

    #[test]
    fn gradients_accumulate_until_zeroed() {
        let mut store = ParamStore::zeros(layout());
        let grad = array![1., 2., 3.];

        store.accumulate_grad("b", grad.view()).unwrap();
        store.accumulate_grad("b", grad.view()).unwrap();
        assert_eq!(&store.grads()[6..9], &[2., 4., 6.]);

        assert!(store.accumulate_grad("w", grad.view()).is_err());

        store.zero_grad();
        assert!(store.grads().iter().all(|&g| g == 0.));
    }

    #[test]
    fn mismatched_layouts_are_detected() {
        let other = ParamLayout::new().push("w", &[2, 3]).unwrap();
        assert!(layout().ensure_matches(&other).is_err());
        assert!(layout().ensure_matches(&layout()).is_ok());
    }
}
