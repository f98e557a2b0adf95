// Copyright the cinnabar developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Memory segments and the joint segment-walk shared by the transfer
//! planner, the issue loop, and the local copy path.

use smallvec::SmallVec;

/// Segment lists, per-segment registration state, and sub-op id arrays are
/// stored inline up to this many entries and spill to the heap beyond it.
pub const INLINE_SEGMENTS: usize = 8;

/// One contiguous byte range in the address space of the process that
/// created the owning handle
///
/// On a deserialized handle `base` is an opaque cookie from the creating
/// process, only meaningful to the transport.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Segment {
    pub base: u64,
    pub len: u64,
}

impl Segment {
    #[inline]
    pub const fn new(base: u64, len: u64) -> Self {
        Self { base, len }
    }
}

pub(crate) type SegmentList = SmallVec<[Segment; INLINE_SEGMENTS]>;

/// Translates a byte offset into a starting segment index and the offset
/// within that segment
///
/// Linear scan; segment counts are small. An offset past the end of the
/// list yields the list length (no segment covers it).
#[inline]
pub(crate) fn offset_translate(segments: &[Segment], offset: u64) -> (usize, u64) {
    let mut remaining = offset;
    for (index, segment) in segments.iter().enumerate() {
        if remaining < segment.len {
            return (index, remaining);
        }
        remaining -= segment.len;
    }
    (segments.len(), 0)
}

/// One sub-transfer produced by the joint walk: a range that is contiguous
/// on both sides
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Chunk {
    pub origin_index: usize,
    pub origin_offset: u64,
    pub local_index: usize,
    pub local_offset: u64,
    pub len: u64,
}

/// Iterates two segment lists jointly, yielding at each step the largest
/// range contiguous in both, capped by the remaining transfer size
///
/// Zero-length segments are skipped without yielding. The planner counts
/// the chunks in a pre-pass and the issue loop walks a clone of the same
/// iterator, so the two always agree.
#[derive(Clone, Debug)]
pub(crate) struct JointChunks<'a> {
    origin: &'a [Segment],
    local: &'a [Segment],
    origin_index: usize,
    origin_offset: u64,
    local_index: usize,
    local_offset: u64,
    remaining: u64,
}

impl<'a> JointChunks<'a> {
    pub fn new(
        origin: &'a [Segment],
        origin_offset: u64,
        local: &'a [Segment],
        local_offset: u64,
        size: u64,
    ) -> Self {
        let (origin_index, origin_offset) = if origin_offset > 0 {
            offset_translate(origin, origin_offset)
        } else {
            (0, 0)
        };
        let (local_index, local_offset) = if local_offset > 0 {
            offset_translate(local, local_offset)
        } else {
            (0, 0)
        };
        Self {
            origin,
            local,
            origin_index,
            origin_offset,
            local_index,
            local_offset,
            remaining: size,
        }
    }
}

impl Iterator for JointChunks<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        loop {
            if self.remaining == 0 {
                return None;
            }
            let origin = self.origin.get(self.origin_index)?;
            let local = self.local.get(self.local_index)?;

            let origin_avail = origin.len - self.origin_offset;
            let local_avail = local.len - self.local_offset;
            if origin_avail == 0 {
                self.origin_index += 1;
                self.origin_offset = 0;
                continue;
            }
            if local_avail == 0 {
                self.local_index += 1;
                self.local_offset = 0;
                continue;
            }

            let len = origin_avail.min(local_avail).min(self.remaining);
            let chunk = Chunk {
                origin_index: self.origin_index,
                origin_offset: self.origin_offset,
                local_index: self.local_index,
                local_offset: self.local_offset,
                len,
            };
            self.remaining -= len;
            self.origin_offset += len;
            self.local_offset += len;
            return Some(chunk);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segs(lens: &[u64]) -> Vec<Segment> {
        lens.iter()
            .scan(0x1000u64, |base, &len| {
                let segment = Segment::new(*base, len);
                *base += len.max(1);
                Some(segment)
            })
            .collect()
    }

    #[test]
    fn offset_translate_walks_boundaries() {
        let segments = segs(&[100, 100, 50]);
        assert_eq!(offset_translate(&segments, 0), (0, 0));
        assert_eq!(offset_translate(&segments, 99), (0, 99));
        assert_eq!(offset_translate(&segments, 100), (1, 0));
        assert_eq!(offset_translate(&segments, 150), (1, 50));
        assert_eq!(offset_translate(&segments, 250), (3, 0));
    }

    #[test]
    fn mismatched_segmentation_splits_at_both_boundaries() {
        // (3, 7) against (5, 5) over 10 bytes must cut at 3, 5 and 10
        let origin = segs(&[3, 7]);
        let local = segs(&[5, 5]);
        let sizes: Vec<u64> = JointChunks::new(&origin, 0, &local, 0, 10)
            .map(|chunk| chunk.len)
            .collect();
        assert_eq!(sizes, [3, 2, 5]);
    }

    #[test]
    fn chunk_sizes_cover_the_request() {
        let origin = segs(&[100, 100]);
        let local = segs(&[50, 150]);
        let chunks: Vec<Chunk> = JointChunks::new(&origin, 0, &local, 0, 200).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len, 50);
        assert_eq!(chunks[1].len, 50);
        assert_eq!(chunks[2].len, 100);
        assert_eq!(chunks[1].origin_index, 0);
        assert_eq!(chunks[1].origin_offset, 50);
        assert_eq!(chunks[1].local_index, 1);
        assert_eq!(chunks[1].local_offset, 0);
        assert_eq!(chunks[2].origin_index, 1);
        assert_eq!(chunks[2].local_offset, 50);
    }

    #[test]
    fn offsets_shift_the_walk() {
        let origin = segs(&[100, 100]);
        let local = segs(&[100, 100]);
        let chunks: Vec<Chunk> = JointChunks::new(&origin, 50, &local, 0, 100).collect();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].origin_index, 0);
        assert_eq!(chunks[0].origin_offset, 50);
        assert_eq!(chunks[0].len, 50);
        assert_eq!(chunks[1].origin_index, 1);
        assert_eq!(chunks[1].local_offset, 50);
        assert_eq!(chunks[1].len, 50);
    }

    #[test]
    fn zero_length_segments_are_skipped() {
        let origin = vec![
            Segment::new(0x1000, 4),
            Segment::new(0, 0),
            Segment::new(0x2000, 4),
        ];
        let local = segs(&[8]);
        let chunks: Vec<Chunk> = JointChunks::new(&origin, 0, &local, 0, 8).collect();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].origin_index, 2);
        assert_eq!(chunks.iter().map(|c| c.len).sum::<u64>(), 8);
    }

    #[test]
    fn truncates_when_a_side_runs_out() {
        let origin = segs(&[4]);
        let local = segs(&[8]);
        let total: u64 = JointChunks::new(&origin, 0, &local, 0, 8)
            .map(|chunk| chunk.len)
            .sum();
        assert_eq!(total, 4);
    }

    #[cfg(not(fuzzing))]
    #[test]
    fn plan_and_walk_agree() {
        // the planner pre-pass (count) and the issue walk are the same
        // iterator, but make sure cloning does not perturb the state
        bolero::check!()
            .with_type::<(Vec<u8>, Vec<u8>, u8, u8, u16)>()
            .cloned()
            .for_each(|(origin_lens, local_lens, origin_off, local_off, size)| {
                let origin: Vec<Segment> = origin_lens
                    .iter()
                    .enumerate()
                    .map(|(i, &len)| Segment::new(0x1000 + ((i as u64) << 10), len as u64))
                    .collect();
                let local: Vec<Segment> = local_lens
                    .iter()
                    .enumerate()
                    .map(|(i, &len)| Segment::new(0x8000_0000 + ((i as u64) << 10), len as u64))
                    .collect();
                let chunks = JointChunks::new(
                    &origin,
                    origin_off as u64,
                    &local,
                    local_off as u64,
                    size as u64,
                );
                let plan = chunks.clone().count();
                let walked: Vec<Chunk> = chunks.collect();
                assert_eq!(plan, walked.len());

                // the walk covers exactly the requested range, truncated
                // to what both sides can hold past their offsets
                let origin_avail: u64 = origin
                    .iter()
                    .map(|segment| segment.len)
                    .sum::<u64>()
                    .saturating_sub(origin_off as u64);
                let local_avail: u64 = local
                    .iter()
                    .map(|segment| segment.len)
                    .sum::<u64>()
                    .saturating_sub(local_off as u64);
                let covered: u64 = walked.iter().map(|chunk| chunk.len).sum();
                assert_eq!(covered, (size as u64).min(origin_avail).min(local_avail));

                // each chunk stays inside its segments
                for chunk in &walked {
                    assert!(chunk.len > 0);
                    assert!(chunk.origin_offset + chunk.len <= origin[chunk.origin_index].len);
                    assert!(chunk.local_offset + chunk.len <= local[chunk.local_index].len);
                }
            });
    }
}
