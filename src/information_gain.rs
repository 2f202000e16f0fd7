//! Information-gain routing loss.
//!
//! Estimates the empirical joint distribution `p(class, branch)` from a batch
//! and scores how informative the branch assignment is about the class label
//! while keeping branch usage balanced. The loss is
//!
//! ```text
//! L = H(C,N) - H(C) - beta * H(N)
//! ```
//!
//! where `H` is Shannon entropy over the batch-estimated distributions and
//! `beta` is the balance coefficient in (0, 1]. With `beta = 1` this is
//! exactly `-I(C;N)`; smaller `beta` attenuates the branch-entropy term that
//! rewards balanced usage. Minimizing the loss therefore drives the routing
//! head toward class-discriminative, load-balanced branch distributions.

use ndarray::{Array1, Array2, Axis};

use crate::errors::{Result, TrellisError};

/// Probabilities are clamped to this floor before any logarithm, so a branch
/// that is never selected within a batch yields a large-but-finite entropy
/// term instead of NaN.
pub const PROB_FLOOR: f32 = 1e-10;

fn check_batch_dims(labels: &Array2<f32>, branch_probs: &Array2<f32>) -> Result<usize> {
    let label_batch = labels.nrows();
    let branch_batch = branch_probs.nrows();
    if label_batch != branch_batch {
        return Err(TrellisError::ShapeMismatch {
            label_batch,
            branch_batch,
        });
    }
    Ok(label_batch)
}

/// Empirical joint `p(class, branch)`, shape (num_classes, num_branches).
///
/// Outer-product accumulation of the label matrix against the branch
/// distribution matrix, normalized by batch size. Rows and columns sum to the
/// class and branch marginals respectively.
fn joint_distribution(labels: &Array2<f32>, branch_probs: &Array2<f32>, batch: usize) -> Array2<f32> {
    labels.t().dot(branch_probs) / batch as f32
}

fn entropy(p: &Array1<f32>) -> f32 {
    -p.iter().map(|&v| v * v.max(PROB_FLOOR).ln()).sum::<f32>()
}

fn entropy_2d(p: &Array2<f32>) -> f32 {
    -p.iter().map(|&v| v * v.max(PROB_FLOOR).ln()).sum::<f32>()
}

/// Information-gain loss for one routing point.
///
/// `labels` is the batch x num_classes one-hot (or soft) label matrix,
/// `branch_probs` the batch x num_branches probability matrix produced by the
/// routing head's tempered softmax. Mismatched batch dimensions fail fast
/// with a shape error; an empty batch contributes zero loss.
pub fn information_gain_loss(
    labels: &Array2<f32>,
    branch_probs: &Array2<f32>,
    balance_coefficient: f32,
) -> Result<f32> {
    let batch = check_batch_dims(labels, branch_probs)?;
    if batch == 0 {
        return Ok(0.0);
    }

    let joint = joint_distribution(labels, branch_probs, batch);
    let p_class = joint.sum_axis(Axis(1));
    let p_branch = joint.sum_axis(Axis(0));

    let h_joint = entropy_2d(&joint);
    let h_class = entropy(&p_class);
    let h_branch = entropy(&p_branch);

    Ok(h_joint - h_class - balance_coefficient * h_branch)
}

/// Analytic gradient of the information-gain loss with respect to the routing
/// head's raw activations, where `branch_probs = softmax(raw / temperature)`.
///
/// The joint estimate is linear in each example's branch distribution, so
///
/// ```text
/// dL/dp[i,n] = (1/B) * sum_c labels[i,c] *
///              (ln p(c) - ln p(c,n) + beta * (ln p(n) + 1))
/// ```
///
/// which is then chained through the tempered-softmax Jacobian. The clamp
/// floor is treated as a constant region (zero slope), matching the loss.
pub fn information_gain_gradient(
    labels: &Array2<f32>,
    branch_probs: &Array2<f32>,
    balance_coefficient: f32,
    temperature: f32,
) -> Result<Array2<f32>> {
    let batch = check_batch_dims(labels, branch_probs)?;
    let num_branches = branch_probs.ncols();
    if batch == 0 {
        return Ok(Array2::zeros((0, num_branches)));
    }

    let joint = joint_distribution(labels, branch_probs, batch);
    let p_class = joint.sum_axis(Axis(1));
    let p_branch = joint.sum_axis(Axis(0));

    let log_class = p_class.mapv(|v| v.max(PROB_FLOOR).ln());
    let log_branch = p_branch.mapv(|v| v.max(PROB_FLOOR).ln());
    let log_joint = joint.mapv(|v| v.max(PROB_FLOOR).ln());

    // dL/dp[i,n], before the softmax Jacobian.
    let mut grad_probs = Array2::<f32>::zeros((batch, num_branches));
    let inv_batch = 1.0 / batch as f32;
    for i in 0..batch {
        for n in 0..num_branches {
            let mut acc = 0.0;
            for c in 0..labels.ncols() {
                let y = labels[[i, c]];
                if y != 0.0 {
                    acc += y
                        * (log_class[c] - log_joint[[c, n]]
                            + balance_coefficient * (log_branch[n] + 1.0));
                }
            }
            grad_probs[[i, n]] = acc * inv_batch;
        }
    }

    // Chain through p = softmax(raw / T):
    // dL/draw[i,k] = p[i,k] * (g[i,k] - sum_j g[i,j] * p[i,j]) / T
    let mut grad_raw = Array2::<f32>::zeros((batch, num_branches));
    for i in 0..batch {
        let row_dot: f32 = (0..num_branches)
            .map(|j| grad_probs[[i, j]] * branch_probs[[i, j]])
            .sum();
        for k in 0..num_branches {
            grad_raw[[i, k]] =
                branch_probs[[i, k]] * (grad_probs[[i, k]] - row_dot) / temperature;
        }
    }

    Ok(grad_raw)
}
