use ndarray::Array2;

use crate::error::{MlErr, Result};

/// Label value excluded from the loss.
pub const IGNORE_INDEX: i64 = -100;

/// Every collated sequence length is a multiple of this value.
pub const SEQ_MULTIPLE: usize = 8;

/// A padded batch of token sequences, shaped `[batch, seq]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    input_ids: Array2<u32>,
    labels: Array2<i64>,
    attention_mask: Array2<u8>,
}

impl Batch {
    /// Creates a new `Batch` checking its shape invariants.
    ///
    /// # Arguments
    /// * `input_ids` - The token ids.
    /// * `labels` - The target ids, `IGNORE_INDEX` where no loss is taken.
    /// * `attention_mask` - 1 on real tokens and 0 on padding.
    pub fn new(
        input_ids: Array2<u32>,
        labels: Array2<i64>,
        attention_mask: Array2<u8>,
    ) -> Result<Self> {
        let shape = input_ids.dim();

        if labels.dim() != shape || attention_mask.dim() != shape {
            return Err(MlErr::InvalidBatch(format!(
                "input_ids {shape:?}, labels {:?} and attention_mask {:?} differ",
                labels.dim(),
                attention_mask.dim()
            )));
        }

        let (rows, seq) = shape;
        if rows == 0 || seq == 0 {
            return Err(MlErr::InvalidBatch(format!("empty batch {shape:?}")));
        }

        if seq % SEQ_MULTIPLE != 0 {
            return Err(MlErr::InvalidBatch(format!(
                "sequence length {seq} is not a multiple of {SEQ_MULTIPLE}"
            )));
        }

        Ok(Self {
            input_ids,
            labels,
            attention_mask,
        })
    }

    /// Pads variable length examples into a single batch.
    ///
    /// Inputs are padded with `pad_token_id`, labels with `IGNORE_INDEX` and the
    /// mask with zeros, up to the longest example rounded up to `SEQ_MULTIPLE`.
    ///
    /// # Arguments
    /// * `rows` - `(input_ids, labels)` pairs of equal length.
    /// * `pad_token_id` - The token used for padding positions.
    pub fn collate<'a, I>(rows: I, pad_token_id: u32) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a [u32], &'a [i64])>,
    {
        let rows: Vec<_> = rows.into_iter().collect();

        for (ids, labels) in &rows {
            if ids.len() != labels.len() {
                return Err(MlErr::SizeMismatch {
                    a: "labels",
                    b: "input_ids",
                    got: labels.len(),
                    expected: ids.len(),
                });
            }
        }

        let longest = rows.iter().map(|(ids, _)| ids.len()).max().unwrap_or(0);
        let seq = longest.div_ceil(SEQ_MULTIPLE) * SEQ_MULTIPLE;
        let shape = (rows.len(), seq);

        let mut input_ids = Array2::from_elem(shape, pad_token_id);
        let mut labels = Array2::from_elem(shape, IGNORE_INDEX);
        let mut attention_mask = Array2::zeros(shape);

        for (i, (ids, lbls)) in rows.iter().enumerate() {
            for (t, (&id, &label)) in ids.iter().zip(lbls.iter()).enumerate() {
                input_ids[[i, t]] = id;
                labels[[i, t]] = label;
                attention_mask[[i, t]] = 1;
            }
        }

        Self::new(input_ids, labels, attention_mask)
    }

    pub fn input_ids(&self) -> &Array2<u32> {
        &self.input_ids
    }

    pub fn labels(&self) -> &Array2<i64> {
        &self.labels
    }

    pub fn attention_mask(&self) -> &Array2<u8> {
        &self.attention_mask
    }

    pub fn batch_size(&self) -> usize {
        self.input_ids.nrows()
    }

    pub fn seq_len(&self) -> usize {
        self.input_ids.ncols()
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array2;

    use super::*;

    #[test]
    fn collate_pads_to_a_multiple_of_eight() {
        let a_ids = [5, 6, 7];
        let a_labels = [5, 6, 7];
        let b_ids: Vec<u32> = (1..=9).collect();
        let b_labels: Vec<i64> = (1..=9).collect();

        let batch = Batch::collate(
            [
                (&a_ids[..], &a_labels[..]),
                (b_ids.as_slice(), b_labels.as_slice()),
            ],
            0,
        )
        .unwrap();

        assert_eq!(batch.batch_size(), 2);
        assert_eq!(batch.seq_len(), 16);
        assert_eq!(batch.input_ids()[[0, 2]], 7);
        assert_eq!(batch.input_ids()[[0, 3]], 0);
        assert_eq!(batch.labels()[[0, 3]], IGNORE_INDEX);
        assert_eq!(batch.attention_mask()[[0, 2]], 1);
        assert_eq!(batch.attention_mask()[[0, 3]], 0);
        assert_eq!(batch.attention_mask()[[1, 8]], 1);
        assert_eq!(batch.attention_mask()[[1, 9]], 0);
    }

    #[test]
    fn ragged_sequence_length_is_rejected() {
        let err = Batch::new(
            Array2::zeros((1, 5)),
            Array2::zeros((1, 5)),
            Array2::zeros((1, 5)),
        )
        .unwrap_err();

        assert!(matches!(err, MlErr::InvalidBatch(_)));
    }

    #[test]
    fn labels_must_match_inputs() {
        let ids = [1, 2, 3];
        let labels = [1, 2];

        assert!(Batch::collate([(&ids[..], &labels[..])], 0).is_err());
    }

    #[test]
    fn empty_batches_are_rejected() {
        assert!(Batch::collate(std::iter::empty(), 0).is_err());
    }
}
