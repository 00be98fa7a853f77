//! Node splitting: axis-wise partition and best-split selection.
//!
//! An overfull node is partitioned twice, once per axis: every child lands
//! in the west or east bucket depending on which outer edge it sits closer
//! to, and independently in the south or north bucket. The more balanced of
//! the two candidate splits wins; ties fall back to minimal overlap between
//! the half MBRs, then minimal total coverage, then west/east.

use crate::bounding_box::Mbr;
use crate::vtree::node::{LeafEntry, NodeOffset};

/// An inner-node child materialized for partitioning: its MBR is read from
/// the child record, used for bucket assignment and discarded afterwards.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChildRef {
    pub mbr: Mbr,
    pub offset: NodeOffset,
}

/// Anything the splitter can partition.
pub trait SplitItem: Clone {
    fn mbr(&self) -> &Mbr;
}

impl SplitItem for LeafEntry {
    fn mbr(&self) -> &Mbr {
        &self.mbr
    }
}

impl SplitItem for ChildRef {
    fn mbr(&self) -> &Mbr {
        &self.mbr
    }
}

/// The two halves of a completed split, with their merged MBRs.
#[derive(Debug)]
pub struct SplitHalves<T> {
    pub first_mbr: Mbr,
    pub first: Vec<T>,
    pub second_mbr: Mbr,
    pub second: Vec<T>,
}

/// Axis-wise bucket assignment over item indices.
struct Partition {
    pw: Vec<usize>,
    ps: Vec<usize>,
    pe: Vec<usize>,
    pn: Vec<usize>,
}

fn partition<T: SplitItem>(outer: &Mbr, items: &[T]) -> Partition {
    let mut part = Partition {
        pw: Vec::new(),
        ps: Vec::new(),
        pe: Vec::new(),
        pn: Vec::new(),
    };
    for (i, item) in items.iter().enumerate() {
        let mbr = item.mbr();
        if mbr.west - outer.west < outer.east - mbr.east {
            part.pw.push(i);
        } else {
            part.pe.push(i);
        }
        if mbr.south - outer.south < outer.north - mbr.north {
            part.ps.push(i);
        } else {
            part.pn.push(i);
        }
    }
    part
}

/// Rebalances the four both-axes-degenerate configurations by halving the
/// non-empty buckets in list order. A single degenerate axis falls through
/// unchanged; the balance criterion then steers selection away from it.
fn rebalance(part: Partition) -> Partition {
    let Partition { pw, ps, pe, pn } = part;
    match (pw.is_empty(), ps.is_empty(), pe.is_empty(), pn.is_empty()) {
        (true, true, false, false) => {
            let (pw, pe) = halve(pe);
            let (ps, pn) = halve(pn);
            Partition { pw, ps, pe, pn }
        }
        (false, false, true, true) => {
            let (pw, pe) = halve(pw);
            let (ps, pn) = halve(ps);
            Partition { pw, ps, pe, pn }
        }
        (false, true, true, false) => {
            let (pw, pe) = halve(pw);
            let (ps, pn) = halve(pn);
            Partition { pw, ps, pe, pn }
        }
        (true, false, false, true) => {
            let (pw, pe) = halve(pe);
            let (ps, pn) = halve(ps);
            Partition { pw, ps, pe, pn }
        }
        (false, false, false, false) => Partition { pw, ps, pe, pn },
        _ => {
            log::warn!("degenerate partition along one axis, splitting unbalanced");
            Partition { pw, ps, pe, pn }
        }
    }
}

fn halve(bucket: Vec<usize>) -> (Vec<usize>, Vec<usize>) {
    let mut first = bucket;
    let second = first.split_off(first.len() / 2);
    (first, second)
}

/// Merge over a bucket; the zero box for an empty bucket (a degenerate axis
/// is never selected, so its MBR is never consulted).
fn merged_mbr<T: SplitItem>(items: &[T], indices: &[usize]) -> Mbr {
    let Some((&first, rest)) = indices.split_first() else {
        return Mbr::zero();
    };
    rest.iter()
        .fold(*items[first].mbr(), |acc, &i| acc.merge(items[i].mbr()))
}

/// Splits an overfull node's children into two halves.
///
/// `outer` is the node's MBR before the split. The caller materializes the
/// child MBRs; the returned halves preserve child list order within each
/// side.
pub fn split_items<T: SplitItem>(outer: &Mbr, items: Vec<T>) -> SplitHalves<T> {
    debug_assert!(items.len() >= 2);
    let part = rebalance(partition(outer, &items));

    let mbr_w = merged_mbr(&items, &part.pw);
    let mbr_e = merged_mbr(&items, &part.pe);
    let mbr_s = merged_mbr(&items, &part.ps);
    let mbr_n = merged_mbr(&items, &part.pn);

    let max_we = part.pw.len().max(part.pe.len());
    let max_sn = part.ps.len().max(part.pn.len());

    let use_we = if max_we < max_sn {
        true
    } else if max_we > max_sn {
        false
    } else {
        let overlap_we = mbr_w.overlap(&mbr_e).area();
        let overlap_sn = mbr_s.overlap(&mbr_n).area();
        if overlap_we < overlap_sn {
            true
        } else if overlap_we > overlap_sn {
            false
        } else {
            let coverage_we = mbr_w.area() + mbr_e.area();
            let coverage_sn = mbr_s.area() + mbr_n.area();
            coverage_sn >= coverage_we
        }
    };

    let (first_idx, first_mbr, second_idx, second_mbr) = if use_we {
        (part.pw, mbr_w, part.pe, mbr_e)
    } else {
        (part.ps, mbr_s, part.pn, mbr_n)
    };

    SplitHalves {
        first_mbr,
        first: gather(&items, &first_idx),
        second_mbr,
        second: gather(&items, &second_idx),
    }
}

fn gather<T: SplitItem>(items: &[T], indices: &[usize]) -> Vec<T> {
    indices.iter().map(|&i| items[i].clone()).collect()
}
