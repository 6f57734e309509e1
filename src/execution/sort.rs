use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use log::debug;

use crate::{
    execution::operator::{BacktrackingIter, QueryOperator, Run},
    storage::{buffer_pool::EFFECTIVE_PAGE_SIZE, schema::Schema, tuple::{Cell, Tuple}},
    utils::ceil_div,
};

/// One run head inside the merge heap. Ordering is by key cells, then
/// by run index so ties drain lower-numbered (earlier) runs first and
/// the sort stays stable.
struct HeapEntry {
    key: Vec<Cell>,
    run_index: usize,
    tuple: Tuple,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed: BinaryHeap is a max-heap and the merge wants the
        // smallest entry on top
        (other.key.as_slice(), other.run_index).cmp(&(self.key.as_slice(), self.run_index))
    }
}

/// External merge sort over `num_buffers` pages of work memory.
///
/// Pass 0 loads blocks of `num_buffers` pages, sorts each in memory
/// and spills it as a run; merge passes then combine up to
/// `num_buffers - 1` runs at a time until a single run remains.
pub struct SortOperator {
    source: Box<dyn QueryOperator>,
    key_columns: Vec<usize>,
    num_buffers: usize,
    tuples_per_page: usize,

    output: Option<Arc<Run>>,
    pos: usize,
}

impl SortOperator {
    pub fn new(source: Box<dyn QueryOperator>, key_columns: Vec<usize>, num_buffers: usize) -> Self {
        assert!(num_buffers >= 3, "external sort needs at least 3 buffers");

        let record_size = source.schema().byte_size().max(1);
        let tuples_per_page = (EFFECTIVE_PAGE_SIZE / record_size).max(1);

        Self {
            source,
            key_columns,
            num_buffers,
            tuples_per_page,
            output: None,
            pos: 0,
        }
    }

    /// Override how many tuples a page is assumed to hold. The tests
    /// use this to force multi-run inputs without gigantic data sets.
    pub fn with_page_capacity(mut self, tuples_per_page: usize) -> Self {
        assert!(tuples_per_page >= 1);
        self.tuples_per_page = tuples_per_page;
        self
    }

    fn key_of(&self, tuple: &Tuple) -> Vec<Cell> {
        self.key_columns.iter().map(|c| tuple.get_cell(*c)).collect()
    }

    /// Sort one in-memory block into a run. Stable: equal keys keep
    /// their input order.
    pub fn sort_run(&self, mut block: Vec<Tuple>) -> Run {
        let key_columns = self.key_columns.clone();
        block.sort_by_cached_key(|t| {
            key_columns
                .iter()
                .map(|c| t.get_cell(*c))
                .collect::<Vec<Cell>>()
        });
        Run::from_tuples(self.source.schema(), block)
    }

    /// Merge up to `num_buffers - 1` sorted runs into one, with a heap
    /// holding one head per run. Ties go to the lower run index.
    pub fn merge(&self, runs: &[Run]) -> Run {
        assert!(
            runs.len() <= self.num_buffers - 1,
            "cannot merge {} runs with {} buffers",
            runs.len(),
            self.num_buffers
        );

        let mut out = Run::new(self.source.schema());
        let mut iters: Vec<std::slice::Iter<'_, Tuple>> = runs.iter().map(|r| r.iter()).collect();
        let mut heap: BinaryHeap<HeapEntry> = BinaryHeap::new();

        for (run_index, iter) in iters.iter_mut().enumerate() {
            if let Some(tuple) = iter.next() {
                heap.push(HeapEntry {
                    key: self.key_of(tuple),
                    run_index,
                    tuple: tuple.clone(),
                });
            }
        }

        while let Some(entry) = heap.pop() {
            if let Some(tuple) = iters[entry.run_index].next() {
                heap.push(HeapEntry {
                    key: self.key_of(tuple),
                    run_index: entry.run_index,
                    tuple: tuple.clone(),
                });
            }
            out.add(entry.tuple);
        }
        out
    }

    /// One merge pass: contiguous groups of `num_buffers - 1` runs
    /// (the last group may be smaller), each merged into one run.
    pub fn merge_pass(&self, runs: Vec<Run>) -> Vec<Run> {
        runs.chunks(self.num_buffers - 1)
            .map(|group| self.merge(group))
            .collect()
    }

    /// Run the whole sort and return the final run.
    pub fn sort(&mut self) -> Run {
        let block_capacity = self.num_buffers * self.tuples_per_page;

        // pass 0: load and sort blocks of `num_buffers` pages
        let mut runs: Vec<Run> = Vec::new();
        loop {
            let mut block = Vec::with_capacity(block_capacity);
            while block.len() < block_capacity {
                match self.source.next() {
                    Some(tuple) => block.push(tuple),
                    None => break,
                }
            }
            if block.is_empty() {
                break;
            }
            runs.push(self.sort_run(block));
        }
        debug!("pass 0 produced {} runs", runs.len());

        if runs.is_empty() {
            return Run::new(self.source.schema());
        }
        while runs.len() > 1 {
            runs = self.merge_pass(runs);
            debug!("merge pass left {} runs", runs.len());
        }
        runs.pop().unwrap()
    }

    fn materialize(&mut self) -> Arc<Run> {
        if self.output.is_none() {
            let run = self.sort();
            self.output = Some(Arc::new(run));
            self.pos = 0;
        }
        Arc::clone(self.output.as_ref().unwrap())
    }

    /// The planner's I/O estimate: every pass reads and writes all `n`
    /// pages once, and there are `1 + ceil(log_{B-1} ceil(n/B))`
    /// passes.
    pub fn estimated_io_cost(&self, num_pages: usize, source_cost: usize) -> usize {
        if num_pages == 0 {
            return source_cost;
        }
        let mut runs = ceil_div(num_pages, self.num_buffers);
        let mut merge_passes = 0;
        while runs > 1 {
            runs = ceil_div(runs, self.num_buffers - 1);
            merge_passes += 1;
        }
        2 * num_pages * (1 + merge_passes) + source_cost
    }
}

impl Iterator for SortOperator {
    type Item = Tuple;

    fn next(&mut self) -> Option<Tuple> {
        self.materialize();

        let run = self.output.as_ref().unwrap();
        if self.pos >= run.len() {
            return None;
        }
        let tuple = run.get(self.pos).clone();
        self.pos += 1;
        Some(tuple)
    }
}

impl QueryOperator for SortOperator {
    fn schema(&self) -> Schema {
        self.source.schema()
    }

    fn sorted_by(&self) -> Vec<usize> {
        self.key_columns.clone()
    }

    fn materialized(&self) -> bool {
        true
    }

    fn backtracking_iter(&mut self) -> Option<BacktrackingIter> {
        Some(BacktrackingIter::new(self.materialize()))
    }
}
