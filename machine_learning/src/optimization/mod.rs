mod adam;
mod factory;
mod gradient_descent;
mod optimizer;

pub use adam::Adam;
pub use factory::{OptimizerConfig, OptimizerErr, OptimizerKind};
pub use gradient_descent::GradientDescent;
pub use optimizer::Optimizer;

use crate::error::{MlErr, Result};

fn check_sizes(params: &[f32], grad: &[f32]) -> Result<()> {
    if grad.len() != params.len() {
        return Err(MlErr::SizeMismatch {
            a: "grad",
            b: "params",
            got: grad.len(),
            expected: params.len(),
        });
    }

    Ok(())
}
