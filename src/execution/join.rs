use std::cmp::Ordering;
use std::sync::Arc;

use crate::{
    execution::{
        operator::{BacktrackingIter, QueryOperator, Run},
        sort::SortOperator,
    },
    storage::{schema::Schema, tuple::{Cell, Tuple}},
};

/// Sort-merge equijoin.
///
/// Both inputs are brought into join-key order (wrapped in a sort
/// operator unless they already are); the right side is additionally
/// materialized so its iterator can back up to the start of the
/// current equal-key block. Each left tuple is then paired with
/// exactly the contiguous equal-key block on the right, once per
/// match.
pub struct SortMergeJoinOperator {
    left: Box<dyn QueryOperator>,
    right: BacktrackingIter,
    left_columns: Vec<usize>,
    right_columns: Vec<usize>,
    schema: Schema,

    left_tuple: Option<Tuple>,
    right_tuple: Option<Tuple>,
    marked: bool,
    started: bool,
}

impl SortMergeJoinOperator {
    pub fn new(
        left: Box<dyn QueryOperator>,
        right: Box<dyn QueryOperator>,
        left_columns: Vec<usize>,
        right_columns: Vec<usize>,
        num_buffers: usize,
    ) -> Self {
        let left: Box<dyn QueryOperator> = if left.sorted_by() == left_columns {
            left
        } else {
            Box::new(SortOperator::new(left, left_columns.clone(), num_buffers))
        };

        let schema = Schema::merge(&left.schema(), &right.schema());

        // materialize the sorted right side for backtracking
        let mut right: Box<dyn QueryOperator> = if right.sorted_by() == right_columns {
            right
        } else {
            Box::new(SortOperator::new(right, right_columns.clone(), num_buffers))
        };
        let right_iter = match right.backtracking_iter() {
            Some(iter) => iter,
            None => {
                let schema = right.schema();
                let tuples: Vec<Tuple> = (&mut right).collect();
                BacktrackingIter::new(Arc::new(Run::from_tuples(schema, tuples)))
            }
        };

        Self {
            left,
            right: right_iter,
            left_columns,
            right_columns,
            schema,
            left_tuple: None,
            right_tuple: None,
            marked: false,
            started: false,
        }
    }

    fn left_key(&self, tuple: &Tuple) -> Vec<Cell> {
        self.left_columns.iter().map(|c| tuple.get_cell(*c)).collect()
    }

    fn right_key(&self, tuple: &Tuple) -> Vec<Cell> {
        self.right_columns.iter().map(|c| tuple.get_cell(*c)).collect()
    }
}

impl Iterator for SortMergeJoinOperator {
    type Item = Tuple;

    fn next(&mut self) -> Option<Tuple> {
        if !self.started {
            self.started = true;
            self.left_tuple = self.left.next();
            self.right_tuple = self.right.next();
        }

        loop {
            let left = match &self.left_tuple {
                Some(t) => t.clone(),
                None => return None,
            };

            let right = match &self.right_tuple {
                Some(t) => t.clone(),
                None => {
                    // right side ran out below the current left tuple
                    if self.marked {
                        // the equal-key block just ended: move left on
                        // and rewind right to the block start
                        self.left_tuple = self.left.next();
                        self.right.reset();
                        self.right_tuple = self.right.next();
                        self.marked = false;
                        continue;
                    }
                    return None;
                }
            };

            match self.left_key(&left).cmp(&self.right_key(&right)) {
                Ordering::Equal => {
                    if !self.marked {
                        self.right.mark_prev();
                        self.marked = true;
                    }
                    let joined = left.concat(&right);
                    self.right_tuple = self.right.next();
                    return Some(joined);
                }
                Ordering::Less => {
                    if self.marked {
                        // finished scanning a block for this left
                        // tuple; the next left may match it again
                        self.left_tuple = self.left.next();
                        self.right.reset();
                        self.right_tuple = self.right.next();
                        self.marked = false;
                    } else {
                        // left key too small to ever match
                        self.left_tuple = self.left.next();
                    }
                }
                Ordering::Greater => {
                    // skip right tuples below the left key
                    self.right_tuple = self.right.next();
                }
            }
        }
    }
}

impl QueryOperator for SortMergeJoinOperator {
    fn schema(&self) -> Schema {
        self.schema.clone()
    }

    fn sorted_by(&self) -> Vec<usize> {
        self.left_columns.clone()
    }
}
