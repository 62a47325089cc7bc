use anyhow::Result;
use candle_core::{DType, Tensor};

/// Numerically stable binary cross-entropy on logits, averaged over all elements.
///
/// ```text
/// BCE = -[y * log(σ(x)) + (1-y) * log(1-σ(x))]
///     = max(x, 0) - x*y + log(1 + exp(-|x|))
/// ```
/// Equal to BCE on `sigmoid(x)` without the saturation of `log(σ(x))`.
pub fn binary_cross_entropy_with_logits_stable(
    logits: &Tensor,
    targets: &Tensor,
) -> Result<Tensor> {
    if logits.shape() != targets.shape() {
        return Err(anyhow::Error::msg(format!(
            "binary_cross_entropy_with_logits: shape mismatch {:?} vs {:?}",
            logits.dims(),
            targets.dims()
        )));
    }

    let dtype = logits.dtype();
    let targets = if targets.dtype() != dtype {
        targets.to_dtype(dtype)?
    } else {
        targets.clone()
    };

    let max_val = logits.maximum(&logits.zeros_like()?)?;
    let log_exp_term = logits.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
    let xy_term = logits.mul(&targets)?;

    let loss = (max_val - xy_term)?.add(&log_exp_term)?;
    Ok(loss.mean_all()?)
}

/// Number of probabilities whose thresholded label (`p > threshold`) matches `labels`.
pub fn count_correct(probs: &Tensor, labels: &Tensor, threshold: f64) -> Result<usize> {
    let predicted = probs.gt(threshold)?.to_dtype(DType::F32)?;
    let labels = labels.to_dtype(DType::F32)?;
    let correct = predicted
        .eq(&labels)?
        .to_dtype(DType::F32)?
        .sum_all()?
        .to_scalar::<f32>()?;
    Ok(correct as usize)
}
