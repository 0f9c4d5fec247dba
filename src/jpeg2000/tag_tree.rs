use crate::constants::TAG_TREE_UNKNOWN;
use crate::error::J2kError;
use crate::jpeg2000::bit_io::J2kBitReader;

/// Quad-tree over a grid of code-blocks, as used by packet headers to signal
/// inclusion layers and zero bit-planes (ISO/IEC 15444-1 B.10.2).
///
/// Leaves are stored first in raster order, followed by each coarser level.
#[derive(Debug, Clone)]
pub struct TagTree {
    nodes: Vec<TagTreeNode>,
    columns: usize,
    rows: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct TagTreeNode {
    value: i32,
    low: i32,
    known: bool,
    parent_index: Option<usize>,
}

impl Default for TagTreeNode {
    fn default() -> Self {
        Self {
            value: TAG_TREE_UNKNOWN,
            low: 0,
            known: false,
            parent_index: None,
        }
    }
}

impl TagTree {
    /// Builds the tree for `columns` x `rows` leaves.
    pub fn new(columns: usize, rows: usize) -> Self {
        let mut nodes = vec![TagTreeNode::default(); columns * rows];

        // Each level groups 2x2 nodes of the level below until a single root remains.
        let (mut start, mut cols, mut lines) = (0, columns, rows);
        while cols * lines > 1 {
            let (parent_cols, parent_lines) = (cols.div_ceil(2), lines.div_ceil(2));
            let parent_start = nodes.len();
            nodes.resize(parent_start + parent_cols * parent_lines, TagTreeNode::default());

            for (i, node) in nodes[start..start + cols * lines].iter_mut().enumerate() {
                let (x, y) = (i % cols, i / cols);
                node.parent_index = Some(parent_start + (y / 2) * parent_cols + x / 2);
            }
            (start, cols, lines) = (parent_start, parent_cols, parent_lines);
        }

        Self {
            nodes,
            columns,
            rows,
        }
    }

    pub fn leaf_count(&self) -> usize {
        self.columns * self.rows
    }

    pub fn leaf_index(&self, x: usize, y: usize) -> usize {
        y * self.columns + x
    }

    /// Reset every node to the unknown state.
    pub fn reset(&mut self) {
        for node in &mut self.nodes {
            node.value = TAG_TREE_UNKNOWN;
            node.low = 0;
            node.known = false;
        }
    }

    /// Resolved value of a leaf, if decoding has found it.
    pub fn value(&self, leaf: usize) -> Option<i32> {
        self.nodes
            .get(leaf)
            .filter(|n| n.known && leaf < self.leaf_count())
            .map(|n| n.value)
    }

    /// Decode the tag tree for `leaf` up to `threshold`.
    ///
    /// Returns whether the leaf value is below `threshold`. Repeated calls resume where
    /// the previous call stopped, so a `true` result stays `true` for larger thresholds.
    pub fn decode(
        &mut self,
        reader: &mut J2kBitReader,
        leaf: usize,
        threshold: i32,
    ) -> Result<bool, J2kError> {
        if leaf >= self.leaf_count() {
            return Err(J2kError::MalformedInput("tag tree leaf out of range"));
        }

        let mut stack = Vec::new();
        let mut idx = leaf;
        while let Some(parent) = self.nodes[idx].parent_index {
            stack.push(idx);
            idx = parent;
        }

        // Walk back down from the root, carrying the running lower bound.
        let mut low = 0;
        loop {
            let node = &mut self.nodes[idx];
            if low > node.low {
                node.low = low;
            } else {
                low = node.low;
            }
            while low < threshold && low < node.value {
                if reader.read_bit()? == 1 {
                    node.value = low;
                    node.known = true;
                } else {
                    low += 1;
                }
            }
            node.low = low;

            match stack.pop() {
                Some(child) => idx = child,
                None => break,
            }
        }

        Ok(self.nodes[leaf].value < threshold)
    }

    /// Decode the full value of `leaf`, raising the threshold one step at a time.
    pub fn decode_value(
        &mut self,
        reader: &mut J2kBitReader,
        leaf: usize,
        limit: i32,
    ) -> Result<i32, J2kError> {
        let mut threshold = 1;
        while !self.decode(reader, leaf, threshold)? {
            if threshold > limit {
                return Err(J2kError::MalformedInput("tag tree value exceeds limit"));
            }
            threshold += 1;
        }
        Ok(threshold - 1)
    }
}

#[cfg(test)]
impl TagTree {
    /// Loads leaf values and their minima into an encoder-side tree.
    pub(crate) fn set_values(&mut self, values: &[i32]) {
        assert_eq!(values.len(), self.leaf_count());
        for node in &mut self.nodes {
            node.value = TAG_TREE_UNKNOWN;
            node.low = 0;
            node.known = false;
        }
        for (leaf, &value) in values.iter().enumerate() {
            let mut idx = Some(leaf);
            while let Some(i) = idx {
                let node = &mut self.nodes[i];
                node.value = node.value.min(value);
                idx = node.parent_index;
            }
        }
    }

    /// Encoder counterpart of [`TagTree::decode`].
    pub(crate) fn encode(
        &mut self,
        writer: &mut crate::jpeg2000::bit_io::J2kBitWriter,
        leaf: usize,
        threshold: i32,
    ) {
        let mut stack = Vec::new();
        let mut idx = leaf;
        while let Some(parent) = self.nodes[idx].parent_index {
            stack.push(idx);
            idx = parent;
        }

        let mut low = 0;
        loop {
            let node = &mut self.nodes[idx];
            if low > node.low {
                node.low = low;
            } else {
                low = node.low;
            }
            while low < threshold {
                if low >= node.value {
                    if !node.known {
                        writer.write_bit(1);
                        node.known = true;
                    }
                    break;
                }
                writer.write_bit(0);
                low += 1;
            }
            node.low = low;

            match stack.pop() {
                Some(child) => idx = child,
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jpeg2000::bit_io::J2kBitWriter;

    #[test]
    fn test_tag_tree_structure() {
        let tt = TagTree::new(3, 3);
        assert_eq!(tt.nodes.len(), 14);

        let leaf0 = &tt.nodes[0];
        assert_eq!(leaf0.parent_index, Some(9));

        let leaf8 = &tt.nodes[8];
        assert_eq!(leaf8.parent_index, Some(12));

        assert_eq!(tt.nodes[13].parent_index, None);
        assert_eq!(TagTree::new(1, 1).nodes.len(), 1);
        assert_eq!(TagTree::new(5, 1).nodes.len(), 5 + 3 + 2 + 1);
    }

    #[test]
    fn test_reset_idempotent() {
        let fresh = TagTree::new(4, 3);
        let mut tt = fresh.clone();
        tt.reset();
        tt.reset();
        tt.reset();
        assert_eq!(tt.nodes, fresh.nodes);
        assert!(tt.nodes.iter().all(|n| n.value == TAG_TREE_UNKNOWN && n.low == 0 && !n.known));
    }

    #[test]
    fn test_single_leaf_resumes() {
        // Value 2: two zero bits then the terminating one bit.
        let data = [0b0010_0000];
        let mut reader = J2kBitReader::new(&data);
        let mut tt = TagTree::new(1, 1);

        assert!(!tt.decode(&mut reader, 0, 1).unwrap());
        assert_eq!(tt.value(0), None);
        assert!(tt.decode(&mut reader, 0, 3).unwrap());
        assert_eq!(tt.value(0), Some(2));
        // Known values consume no further bits.
        let position = reader.position();
        assert!(tt.decode(&mut reader, 0, 50).unwrap());
        assert_eq!(reader.position(), position);
    }

    #[test]
    fn test_decode_matches_encoder() {
        let (w, h) = (5, 3);
        let mut seed = 0x2545_f491u32;
        let values: Vec<i32> = (0..w * h)
            .map(|_| {
                seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                ((seed >> 16) % 6) as i32
            })
            .collect();

        let mut encoder = TagTree::new(w, h);
        encoder.set_values(&values);
        let mut writer = J2kBitWriter::new();
        for threshold in 1..=7 {
            for leaf in 0..w * h {
                encoder.encode(&mut writer, leaf, threshold);
            }
        }
        let data = writer.finish();

        let mut decoder = TagTree::new(w, h);
        let mut reader = J2kBitReader::new(&data);
        for threshold in 1..=7 {
            for leaf in 0..w * h {
                let below = decoder.decode(&mut reader, leaf, threshold).unwrap();
                assert_eq!(below, values[leaf] < threshold, "leaf {leaf} threshold {threshold}");
            }
        }
        for (leaf, &value) in values.iter().enumerate() {
            assert_eq!(decoder.value(leaf), Some(value));
        }
    }

    #[test]
    fn test_monotonic_thresholds() {
        let values = [3, 0, 5, 1];
        let mut encoder = TagTree::new(2, 2);
        encoder.set_values(&values);
        let mut writer = J2kBitWriter::new();
        for threshold in [2, 4, 6] {
            encoder.encode(&mut writer, 2, threshold);
        }
        let data = writer.finish();

        let mut decoder = TagTree::new(2, 2);
        let mut reader = J2kBitReader::new(&data);
        let mut seen_true = false;
        for threshold in [2, 4, 6] {
            let below = decoder.decode(&mut reader, 2, threshold).unwrap();
            assert!(!seen_true || below);
            seen_true |= below;
        }
        assert!(seen_true);
        assert!(decoder.decode(&mut reader, 2, 100).unwrap());
    }

    #[test]
    fn test_decode_value() {
        let mut encoder = TagTree::new(2, 1);
        encoder.set_values(&[4, 2]);
        let mut writer = J2kBitWriter::new();
        for threshold in 1..=5 {
            encoder.encode(&mut writer, 0, threshold);
        }
        for threshold in 1..=3 {
            encoder.encode(&mut writer, 1, threshold);
        }
        let data = writer.finish();

        let mut decoder = TagTree::new(2, 1);
        let mut reader = J2kBitReader::new(&data);
        assert_eq!(decoder.decode_value(&mut reader, 0, 64).unwrap(), 4);
        assert_eq!(decoder.decode_value(&mut reader, 1, 64).unwrap(), 2);
    }

    #[test]
    fn test_leaf_out_of_range() {
        let mut tt = TagTree::new(2, 2);
        let mut reader = J2kBitReader::new(&[]);
        assert!(tt.decode(&mut reader, 4, 1).is_err());
    }
}
