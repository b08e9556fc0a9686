//! Cumulative sums along the time axis of `[batch_heads, t_len, width]` buffers.

use rayon::prelude::*;

use crate::Acc;

/// Below this many elements the sums run on the calling thread.
const PAR_THRESHOLD: usize = 4096;

/// In-place cumulative sum over time, independently per batch-head and lane.
///
/// With `from_end` each entry becomes the sum of itself and every later
/// timestep (suffix sum); otherwise of itself and every earlier one.
pub fn cumsum_time(data: &mut [Acc], t_len: usize, width: usize, from_end: bool) {
    let head_len = t_len * width;
    if head_len == 0 {
        return;
    }
    assert_eq!(data.len() % head_len, 0, "buffer is not a whole number of heads");

    let scan = |head: &mut [Acc]| {
        if from_end {
            for t in (0..t_len - 1).rev() {
                let (cur, next) = head[t * width..(t + 2) * width].split_at_mut(width);
                cur.iter_mut().zip(next.iter()).for_each(|(c, &n)| *c += n);
            }
        } else {
            for t in 1..t_len {
                let (prev, cur) = head[(t - 1) * width..(t + 1) * width].split_at_mut(width);
                cur.iter_mut().zip(prev.iter()).for_each(|(c, &p)| *c += p);
            }
        }
    };

    if data.len() >= PAR_THRESHOLD {
        data.par_chunks_mut(head_len).for_each(scan);
    } else {
        data.chunks_mut(head_len).for_each(scan);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_sum() {
        let mut data = vec![1.0, 10.0, 2.0, 20.0, 3.0, 30.0];
        cumsum_time(&mut data, 3, 2, false);
        assert_eq!(data, vec![1.0, 10.0, 3.0, 30.0, 6.0, 60.0]);
    }

    #[test]
    fn test_suffix_sum() {
        let mut data = vec![1.0, 2.0, 3.0];
        cumsum_time(&mut data, 3, 1, true);
        assert_eq!(data, vec![6.0, 5.0, 3.0]);
    }

    #[test]
    fn test_heads_are_independent() {
        let mut data = vec![1.0, 1.0, 5.0, 5.0];
        cumsum_time(&mut data, 2, 1, false);
        assert_eq!(data, vec![1.0, 2.0, 5.0, 10.0]);
    }

    #[test]
    fn test_parallel_path_matches_serial() {
        let heads = 64;
        let (t_len, width) = (32, 4);
        let base: Vec<Acc> = (0..heads * t_len * width).map(|i| (i % 7) as Acc).collect();

        let mut par = base.clone();
        cumsum_time(&mut par, t_len, width, true);

        let mut serial = Vec::new();
        for head in base.chunks(t_len * width) {
            let mut h = head.to_vec();
            cumsum_time(&mut h, t_len, width, true);
            serial.extend(h);
        }
        assert_eq!(par, serial);
    }

    #[test]
    fn test_empty_time_axis() {
        let mut data: Vec<Acc> = Vec::new();
        cumsum_time(&mut data, 0, 4, true);
        assert!(data.is_empty());
    }
}
