//! Pluggable cost functions choosing where pages split and rebalance.
//!
//! A score of zero rejects a candidate; among accepted candidates the
//! highest score wins.

use serde::{Deserialize, Serialize};

/// Observed insertion order, used to bias splits for sequential loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Sequence {
    Forward,
    Reverse,
    #[default]
    None,
}

/// One candidate split point. Sizes exclude the page header.
#[derive(Debug, Clone, Copy)]
pub struct SplitCandidate {
    /// Key block offset of the proposed first key of the right page.
    pub key_block: usize,
    pub insert_at: usize,
    pub replace: bool,
    pub left_size: usize,
    pub right_size: usize,
    pub current_size: usize,
    pub virtual_size: usize,
    pub capacity: usize,
    pub split_best: u32,
    pub sequence: Sequence,
}

impl SplitCandidate {
    #[inline]
    pub fn fits(&self) -> bool {
        self.left_size <= self.capacity && self.right_size <= self.capacity
    }
}

/// One candidate rebalance point between two sibling pages.
#[derive(Debug, Clone, Copy)]
pub struct RebalanceCandidate {
    pub key_block: usize,
    pub found_at1: usize,
    pub found_at2: usize,
    pub virtual_size: usize,
    pub left_size: usize,
    pub right_size: usize,
    pub capacity: usize,
}

impl RebalanceCandidate {
    #[inline]
    pub fn fits(&self) -> bool {
        self.left_size <= self.capacity && self.right_size <= self.capacity
    }
}

pub trait SplitPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn split_fit(&self, candidate: &SplitCandidate) -> u32;
}

pub trait JoinPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// True when a page of `virtual_size` bytes (header included) should
    /// absorb its right sibling.
    fn accept_join(&self, buffer_size: usize, virtual_size: usize) -> bool;

    fn rebalance_fit(&self, candidate: &RebalanceCandidate) -> u32;
}

#[inline]
fn even_score(left: usize, right: usize, capacity: usize) -> u32 {
    (capacity * 2 - left.abs_diff(right).min(capacity * 2 - 1)) as u32
}

/// Minimizes the larger of the two halves.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvenSplit;

impl SplitPolicy for EvenSplit {
    fn name(&self) -> &'static str {
        "EVEN"
    }

    fn split_fit(&self, c: &SplitCandidate) -> u32 {
        if !c.fits() {
            return 0;
        }
        even_score(c.left_size, c.right_size, c.capacity)
    }
}

/// Fills the left page as far as possible.
#[derive(Debug, Clone, Copy, Default)]
pub struct LeftBiasSplit;

impl SplitPolicy for LeftBiasSplit {
    fn name(&self) -> &'static str {
        "LEFT"
    }

    fn split_fit(&self, c: &SplitCandidate) -> u32 {
        if !c.fits() {
            return 0;
        }
        c.left_size as u32 + 1
    }
}

/// Fills the right page as far as possible.
#[derive(Debug, Clone, Copy, Default)]
pub struct RightBiasSplit;

impl SplitPolicy for RightBiasSplit {
    fn name(&self) -> &'static str {
        "RIGHT"
    }

    fn split_fit(&self, c: &SplitCandidate) -> u32 {
        if !c.fits() {
            return 0;
        }
        c.right_size as u32 + 1
    }
}

/// Packs pages densely for sequential loads, splits evenly otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct PackSplit;

impl SplitPolicy for PackSplit {
    fn name(&self) -> &'static str {
        "PACK"
    }

    fn split_fit(&self, c: &SplitCandidate) -> u32 {
        match c.sequence {
            Sequence::Forward => LeftBiasSplit.split_fit(c),
            Sequence::Reverse => RightBiasSplit.split_fit(c),
            Sequence::None => EvenSplit.split_fit(c),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EvenJoin;

impl JoinPolicy for EvenJoin {
    fn name(&self) -> &'static str {
        "EVEN"
    }

    fn accept_join(&self, buffer_size: usize, virtual_size: usize) -> bool {
        virtual_size <= buffer_size
    }

    fn rebalance_fit(&self, c: &RebalanceCandidate) -> u32 {
        if !c.fits() {
            return 0;
        }
        even_score(c.left_size, c.right_size, c.capacity)
    }
}

/// Rebalances with as much as possible on the left page.
#[derive(Debug, Clone, Copy, Default)]
pub struct LeftBiasJoin;

impl JoinPolicy for LeftBiasJoin {
    fn name(&self) -> &'static str {
        "LEFT"
    }

    fn accept_join(&self, buffer_size: usize, virtual_size: usize) -> bool {
        virtual_size <= buffer_size
    }

    fn rebalance_fit(&self, c: &RebalanceCandidate) -> u32 {
        if !c.fits() {
            return 0;
        }
        c.left_size as u32 + 1
    }
}
