//! Token level cross entropy over rows of logits.

use ndarray::{Array2, ArrayView1, ArrayView2, Zip};

fn log_sum_exp(row: ArrayView1<f32>) -> (f32, f64) {
    let max = row.fold(f32::NEG_INFINITY, |m, &x| m.max(x));
    let sum: f64 = row.iter().map(|&x| f64::from(x - max).exp()).sum();
    (max, sum)
}

/// Mean negative log likelihood of the targeted rows.
///
/// # Arguments
/// * `logits` - Unnormalized scores, one row per position.
/// * `targets` - The expected class of each row, `None` for ignored rows.
///
/// # Returns
/// The mean loss and the amount of rows that took part in it. The loss is
/// zero when no row is targeted.
pub fn cross_entropy(logits: ArrayView2<f32>, targets: &[Option<usize>]) -> (f32, usize) {
    let mut total = 0f64;
    let mut count = 0;

    for (row, target) in logits.rows().into_iter().zip(targets) {
        let Some(target) = *target else {
            continue;
        };

        let (max, sum) = log_sum_exp(row);
        total += sum.ln() + f64::from(max) - f64::from(row[target]);
        count += 1;
    }

    if count == 0 {
        return (0., 0);
    }

    ((total / count as f64) as f32, count)
}

/// Gradient of `scale * cross_entropy` summed over the targeted rows.
///
/// Callers wanting the gradient of the mean divide `scale` by the count.
pub fn cross_entropy_grad(
    logits: ArrayView2<f32>,
    targets: &[Option<usize>],
    scale: f32,
) -> Array2<f32> {
    let mut grad = Array2::zeros(logits.raw_dim());

    Zip::from(grad.rows_mut())
        .and(logits.rows())
        .and(&ArrayView1::from(targets))
        .par_for_each(|mut g, row, target| {
            let Some(target) = *target else {
                return;
            };

            let (max, sum) = log_sum_exp(row);
            g.zip_mut_with(&row, |g, &x| {
                *g = (f64::from(x - max).exp() / sum) as f32 * scale;
            });
            g[target] -= scale;
        });

    grad
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn uniform_logits_cost_log_classes() {
        let logits = Array2::<f32>::zeros((3, 4));
        let (loss, count) = cross_entropy(logits.view(), &[Some(0), None, Some(3)]);

        assert_eq!(count, 2);
        assert!((loss - 4f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn untargeted_rows_have_no_loss_nor_gradient() {
        let logits = array![[1., 2.], [3., -1.]];
        let targets = [None, None];

        assert_eq!(cross_entropy(logits.view(), &targets), (0., 0));
        assert!(
            cross_entropy_grad(logits.view(), &targets, 1.)
                .iter()
                .all(|&g| g == 0.)
        );
    }

    #[test]
    fn gradient_rows_sum_to_zero() {
        let logits = array![[0.5, -1., 2.], [0., 0., 0.]];
        let grad = cross_entropy_grad(logits.view(), &[Some(2), Some(1)], 0.5);

        for row in grad.rows() {
            assert!(row.sum().abs() < 1e-6);
        }
        assert!((grad[[1, 1]] - 0.5 * (1. / 3. - 1.)).abs() < 1e-6);
    }
}
