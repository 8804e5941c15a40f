use std::io::{Read, Seek};

use ndarray::{s, Array2};

use crate::error::{ProfusionError, Result};
use crate::segment::PayloadFile;

/// Where one segment lands in the merged signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPlacement {
    /// Index of the payload file in import order
    pub file: usize,
    /// Index of the segment within its file
    pub segment: usize,
    /// First output column of the segment's samples
    pub column: usize,
    pub n_samples: usize,
    /// Zero columns inserted right before this segment
    pub padding: usize,
}

/// Column layout of a merge, computed from segment records alone
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergePlan {
    pub blocks: Vec<BlockPlacement>,
    /// Total output width in samples
    pub width: usize,
}

impl MergePlan {
    /// Total zero-padded columns
    pub fn padded_samples(&self) -> usize {
        self.blocks.iter().map(|b| b.padding).sum()
    }
}

/// Lays out every segment of `files` on one time axis
///
/// Segments are taken file by file, then in file order. A running sample
/// counter starts at 0. With `pad_gaps`, a segment whose `first_sample` lies
/// beyond the counter is preceded by zero columns up to `first_sample`;
/// without it, segments are concatenated back to back and any acquisition
/// gap is dropped from the timeline.
pub fn plan_merge<R: Read + Seek>(files: &[PayloadFile<R>], pad_gaps: bool) -> Result<MergePlan> {
    let mut plan = MergePlan::default();
    let mut counter: i64 = 0;
    let mut column: usize = 0;

    for (file_idx, file) in files.iter().enumerate() {
        for (seg_idx, segment) in file.segments().iter().enumerate() {
            let mut padding = 0;
            if pad_gaps && segment.first_sample > counter {
                padding = segment
                    .first_sample
                    .checked_sub(counter)
                    .and_then(|gap| usize::try_from(gap).ok())
                    .ok_or_else(|| overflow(file.name(), seg_idx))?;
                log::debug!(
                    "Padding 0s at time index [{}, {}]",
                    counter,
                    segment.first_sample
                );
                counter = segment.first_sample;
            }

            column = column
                .checked_add(padding)
                .ok_or_else(|| overflow(file.name(), seg_idx))?;
            plan.blocks.push(BlockPlacement {
                file: file_idx,
                segment: seg_idx,
                column,
                n_samples: segment.shape.1,
                padding,
            });
            column = column
                .checked_add(segment.shape.1)
                .ok_or_else(|| overflow(file.name(), seg_idx))?;
            counter = counter
                .checked_add(segment.n_samples)
                .ok_or_else(|| overflow(file.name(), seg_idx))?;
        }
    }

    plan.width = column;
    Ok(plan)
}

fn overflow(name: &str, segment: usize) -> ProfusionError {
    ProfusionError::MalformedSegment(format!(
        "{} segment {}: sample offsets overflow the merged time axis",
        name, segment
    ))
}

/// Concatenates all segments into one `[n_channels, width]` matrix
///
/// Loads (and caches) every segment. Padding columns are zero.
///
/// # Errors
///
/// * `ProfusionError::Inconsistent` - a segment's channel count differs from `n_channels`
/// * `ProfusionError::Truncated` - a segment payload is cut short
/// * `ProfusionError::MalformedSegment` - sample offsets overflow, or the
///   merged matrix is too large to allocate
pub fn merge_segments<R: Read + Seek>(
    files: &mut [PayloadFile<R>],
    n_channels: usize,
    pad_gaps: bool,
) -> Result<Array2<f32>> {
    let plan = plan_merge(files, pad_gaps)?;
    log::debug!(
        "Merging {} segment(s) into {} x {} ({} padded sample(s))",
        plan.blocks.len(),
        n_channels,
        plan.width,
        plan.padded_samples()
    );

    let too_large = || {
        ProfusionError::MalformedSegment(format!(
            "merged signal of {} x {} samples cannot be allocated",
            n_channels, plan.width
        ))
    };
    let len = n_channels.checked_mul(plan.width).ok_or_else(too_large)?;
    let mut values = Vec::new();
    values.try_reserve_exact(len).map_err(|_| too_large())?;
    values.resize(len, 0.0f32);
    let mut merged = Array2::from_shape_vec((n_channels, plan.width), values)
        .map_err(|e| ProfusionError::Inconsistent(e.to_string()))?;

    for block in &plan.blocks {
        let file = &mut files[block.file];
        let name = file.name().to_string();
        let data = file.load_segment(block.segment)?;

        if data.nrows() != n_channels {
            return Err(ProfusionError::Inconsistent(format!(
                "{} segment {} has {} channel(s), expected {}",
                name,
                block.segment,
                data.nrows(),
                n_channels
            )));
        }

        merged
            .slice_mut(s![.., block.column..block.column + block.n_samples])
            .assign(data);
    }

    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doctest_utils::{payload_file_bytes, TestSegment};
    use crate::types::SegmentFileHeader;
    use std::io::Cursor;

    fn open(segments: &[TestSegment], n_channels: usize) -> PayloadFile<Cursor<Vec<u8>>> {
        let bytes = payload_file_bytes(segments, n_channels, false, 0);
        let header = SegmentFileHeader {
            max_samples_per_file: 10_000,
            n_channels,
        };
        PayloadFile::from_reader("m.rda".into(), Cursor::new(bytes), &header).unwrap()
    }

    fn gapped() -> Vec<TestSegment> {
        vec![
            TestSegment::ramp(0, 2, 100, 0.0),
            TestSegment::ramp(150, 2, 50, 1000.0),
        ]
    }

    #[test]
    fn test_pad_gaps_inserts_zeros() {
        let mut files = vec![open(&gapped(), 2)];
        let merged = merge_segments(&mut files, 2, true).unwrap();

        assert_eq!(merged.shape(), &[2, 200]);
        assert_eq!(merged[[0, 99]], 99.0);
        for col in 100..150 {
            assert_eq!(merged[[0, col]], 0.0);
            assert_eq!(merged[[1, col]], 0.0);
        }
        assert_eq!(merged[[0, 150]], 1000.0);
        assert_eq!(merged[[1, 199]], gapped()[1].channels[1][49]);
    }

    #[test]
    fn test_without_padding_concatenates() {
        let mut files = vec![open(&gapped(), 2)];
        let merged = merge_segments(&mut files, 2, false).unwrap();

        assert_eq!(merged.shape(), &[2, 150]);
        assert_eq!(merged[[0, 100]], 1000.0);
    }

    #[test]
    fn test_plan_across_files() {
        let files = vec![
            open(&[TestSegment::ramp(0, 1, 10, 0.0)], 1),
            open(
                &[TestSegment::ramp(5, 1, 10, 0.0), TestSegment::ramp(30, 1, 5, 0.0)],
                1,
            ),
        ];

        // 第二个文件的首段与计数器重叠，不补零
        let plan = plan_merge(&files, true).unwrap();
        assert_eq!(plan.width, 35);
        assert_eq!(plan.padded_samples(), 10);
        assert_eq!(plan.blocks[1], BlockPlacement { file: 1, segment: 0, column: 10, n_samples: 10, padding: 0 });
        assert_eq!(plan.blocks[2], BlockPlacement { file: 1, segment: 1, column: 30, n_samples: 5, padding: 10 });

        let plan = plan_merge(&files, false).unwrap();
        assert_eq!(plan.width, 25);
        assert_eq!(plan.padded_samples(), 0);
    }

    #[test]
    fn test_channel_mismatch_is_inconsistent() {
        let mut files = vec![open(&[TestSegment::ramp(0, 2, 4, 0.0)], 2)];
        assert!(matches!(
            merge_segments(&mut files, 3, false),
            Err(ProfusionError::Inconsistent(_))
        ));
    }

    #[test]
    fn test_counter_overflow_is_malformed() {
        let files = vec![open(
            &[
                TestSegment::ramp(i64::MAX - 4, 1, 4, 0.0),
                TestSegment::ramp(0, 1, 8, 0.0),
            ],
            1,
        )];

        assert!(matches!(
            plan_merge(&files, true),
            Err(ProfusionError::MalformedSegment(_))
        ));
    }

    #[test]
    fn test_absurd_gap_is_rejected_without_aborting() {
        let mut files = vec![open(
            &[
                TestSegment::ramp(0, 2, 4, 0.0),
                TestSegment::ramp(100_000_000_000_000_000, 2, 4, 0.0),
            ],
            2,
        )];

        let plan = plan_merge(&files, true).unwrap();
        assert_eq!(plan.width, 100_000_000_000_000_004);
        assert!(matches!(
            merge_segments(&mut files, 2, true),
            Err(ProfusionError::MalformedSegment(_))
        ));

        // 不补零时同样的数据可以正常合并
        let merged = merge_segments(&mut files, 2, false).unwrap();
        assert_eq!(merged.shape(), &[2, 8]);
    }
}
