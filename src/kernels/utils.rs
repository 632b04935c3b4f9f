/// Round `value` up to the next multiple of `align`.
#[inline]
pub fn align_to(value: usize, align: usize) -> usize {
    if align == 0 {
        return value;
    }
    value.div_ceil(align) * align
}

#[inline]
pub fn ceil_div(value: usize, divisor: usize) -> usize {
    value.div_ceil(divisor)
}

/// Largest divisor of `parent` that does not exceed `threshold`.
///
/// Odd parents are only searched over odd candidates. The search walks
/// downward from `min(threshold, parent)` and is a tuning heuristic, so the
/// exact walk order matters for reproducible launch shapes.
pub fn find_max_factor(parent: usize, threshold: usize) -> usize {
    if parent == 1 || threshold == 1 {
        return 1;
    }
    let step = 1 + (parent & 1);
    let mut threshold = threshold;
    if step == 2 && threshold > 0 {
        threshold = ((threshold - 1) >> 1 << 1) + 1;
    }
    let mut i = threshold.min(parent);
    while i > 0 && i <= threshold {
        if parent % i == 0 {
            return i;
        }
        if i < step {
            break;
        }
        i -= step;
    }
    1
}

pub fn ensure_len(v: &mut Vec<f64>, len: usize) {
    if v.len() != len {
        v.clear();
        v.resize(len, 0.0);
    }
}
