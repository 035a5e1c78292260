//! Reading and writing flat parameter stores as safetensors files.

use std::{fs, path::Path};

use safetensors::{
    SafeTensors,
    tensor::{Dtype, TensorView},
};

use crate::{
    ParamLayout, ParamStore,
    error::{MlErr, Result},
};

/// Writes every tensor of `store` to `path` in the safetensors format.
pub(crate) fn save(store: &ParamStore, path: &Path) -> Result<()> {
    let params = store.params();
    let mut views = Vec::with_capacity(store.layout().iter().count());

    for meta in store.layout().iter() {
        let bytes: &[u8] = bytemuck::cast_slice(&params[meta.range()]);
        let view = TensorView::new(Dtype::F32, meta.shape.clone(), bytes)?;
        views.push((meta.name.as_str(), view));
    }

    let bytes = safetensors::serialize(views, &None)?;
    fs::write(path, bytes)?;
    Ok(())
}

/// Loads the tensors named by `layout` from the safetensors file at `path`.
///
/// Extra tensors in the file are ignored, missing or misshaped ones are errors.
pub(crate) fn load(layout: ParamLayout, path: &Path) -> Result<ParamStore> {
    let bytes = fs::read(path)?;
    let file = SafeTensors::deserialize(&bytes)?;
    let mut params = Vec::with_capacity(layout.total());

    for meta in layout.iter() {
        let tensor = file.tensor(&meta.name)?;

        if tensor.dtype() != Dtype::F32 {
            return Err(MlErr::LayoutMismatch(format!(
                "{} is stored as {:?}, expected F32",
                meta.name,
                tensor.dtype()
            )));
        }

        if tensor.shape() != meta.shape.as_slice() {
            return Err(MlErr::LayoutMismatch(format!(
                "{} is stored with shape {:?}, expected {:?}",
                meta.name,
                tensor.shape(),
                meta.shape
            )));
        }

        params.extend(bytemuck::pod_collect_to_vec::<u8, f32>(tensor.data()));
    }

    ParamStore::from_parts(layout, params)
}
