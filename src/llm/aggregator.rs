//! Fragment batching for streaming transport.
//!
//! The engine emits one fragment per decoding step; sending each one as its
//! own SSE event is wasteful, so the aggregator regroups them into chunks of
//! `batch_size` fragments. One-ahead buffering lets the final chunk be
//! tagged `is_last` at the moment it is emitted, without ever materializing
//! the whole response.

use crate::llm::{Fragment, ResponseChunk};

pub struct ChunkAggregator<I> {
    source: I,
    batch_size: usize,
    lookahead: Option<Fragment>,
    primed: bool,
    buffer: String,
    buffered: usize,
    emitted_any: bool,
    done: bool,
}

impl<I> ChunkAggregator<I>
where
    I: Iterator<Item = Fragment>,
{
    pub fn new(source: I, batch_size: usize) -> Self {
        Self {
            source,
            batch_size: batch_size.max(1),
            lookahead: None,
            primed: false,
            buffer: String::new(),
            buffered: 0,
            emitted_any: false,
            done: false,
        }
    }

    fn emit(&mut self, is_last: bool) -> ResponseChunk {
        let chunk = ResponseChunk {
            text: std::mem::take(&mut self.buffer),
            is_first: !self.emitted_any,
            is_last,
        };
        self.emitted_any = true;
        self.buffered = 0;
        chunk
    }
}

impl<I> Iterator for ChunkAggregator<I>
where
    I: Iterator<Item = Fragment>,
{
    type Item = ResponseChunk;

    fn next(&mut self) -> Option<ResponseChunk> {
        if self.done {
            return None;
        }

        if !self.primed {
            self.primed = true;
            self.lookahead = self.source.next();
            if self.lookahead.is_none() {
                // Empty generation: no first item, so no trailing emission.
                self.done = true;
                return None;
            }
        }

        while let Some(fragment) = self.lookahead.take() {
            self.lookahead = self.source.next();
            self.buffer.push_str(&fragment.text);
            self.buffered += 1;

            if self.lookahead.is_none() {
                self.done = true;
                return Some(self.emit(true));
            }
            if self.buffered == self.batch_size {
                return Some(self.emit(false));
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragments(n: usize) -> Vec<Fragment> {
        (0..n).map(|i| Fragment::new(format!("f{i} "))).collect()
    }

    fn chunks(n: usize, batch_size: usize) -> Vec<ResponseChunk> {
        ChunkAggregator::new(fragments(n).into_iter(), batch_size).collect()
    }

    #[test]
    fn empty_source_yields_no_chunks() {
        assert!(chunks(0, 3).is_empty());
    }

    #[test]
    fn chunk_count_is_ceil_of_fragments_over_batch() {
        for (n, b) in [(1, 1), (1, 4), (4, 4), (5, 2), (7, 3), (9, 3)] {
            let got = chunks(n, b).len();
            let want = n.div_ceil(b);
            assert_eq!(got, want, "n={n} b={b}");
        }
    }

    #[test]
    fn exactly_one_first_and_one_last_flag() {
        for (n, b) in [(1, 1), (3, 3), (5, 2), (8, 4)] {
            let out = chunks(n, b);
            assert_eq!(out.iter().filter(|c| c.is_first).count(), 1, "n={n} b={b}");
            assert_eq!(out.iter().filter(|c| c.is_last).count(), 1, "n={n} b={b}");
            assert!(out.first().unwrap().is_first);
            assert!(out.last().unwrap().is_last);
        }
    }

    #[test]
    fn single_chunk_is_both_first_and_last() {
        let out = chunks(2, 5);
        assert_eq!(out.len(), 1);
        assert!(out[0].is_first);
        assert!(out[0].is_last);
    }

    #[test]
    fn no_text_is_lost_or_reordered() {
        for (n, b) in [(1, 1), (5, 2), (6, 3), (10, 4)] {
            let joined: String = chunks(n, b).into_iter().map(|c| c.text).collect();
            let expected: String = fragments(n).into_iter().map(|f| f.text).collect();
            assert_eq!(joined, expected, "n={n} b={b}");
        }
    }

    #[test]
    fn interior_chunks_hold_exactly_batch_size_fragments() {
        // 7 fragments at batch size 3: [3][3][1], only the tail is short.
        let out = chunks(7, 3);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].text, "f0 f1 f2 ");
        assert_eq!(out[1].text, "f3 f4 f5 ");
        assert_eq!(out[2].text, "f6 ");
    }

    #[test]
    fn batch_size_zero_is_treated_as_one() {
        let out = chunks(3, 0);
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn boundaries_are_deterministic() {
        let a = chunks(9, 4);
        let b = chunks(9, 4);
        assert_eq!(a, b);
    }
}
