//! Printed page numbers and the deterministic reading-order sort.
//!
//! The ordering prompt asks the model to apply exactly the procedure in
//! [`order_by_printed_numbers`]; this module is the local reference of it.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::Page;

/// Lines at the top and at the bottom of a page searched for an indicator.
const ZONE_LINES: usize = 3;

static PAGE_WORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:page|pg\.?)\s*(\d{1,4})(?:\s*(?:of|/)\s*\d{1,4})?\b").unwrap()
});
static FRACTION: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d{1,3})\s*/\s*(\d{1,3})$").unwrap());
static STANDALONE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[-\u{2013}\u{2014}]?\s*(\d{1,3})\s*[-\u{2013}\u{2014}]?$").unwrap());

/// The printed page number of `text`, if the page shows an explicit one.
///
/// Only header and footer lines are considered. In priority order, an
/// indicator is "Page 3" / "Page 3 of 7", a whole-line fraction "3/7", or a
/// whole-line integer of at most three digits.
pub fn detect_printed_number(text: &str) -> Option<u32> {
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    let zone: Vec<&str> = if lines.len() <= 2 * ZONE_LINES {
        lines
    } else {
        lines[..ZONE_LINES]
            .iter()
            .chain(&lines[lines.len() - ZONE_LINES..])
            .copied()
            .collect()
    };

    let page_word = zone
        .iter()
        .find_map(|l| PAGE_WORD.captures(l).and_then(|c| c[1].parse().ok()));
    if page_word.is_some() {
        return page_word;
    }

    let fraction = zone.iter().find_map(|l| {
        let caps = FRACTION.captures(l)?;
        let n: u32 = caps[1].parse().ok()?;
        let total: u32 = caps[2].parse().ok()?;
        (n >= 1 && n <= total).then_some(n)
    });
    if fraction.is_some() {
        return fraction;
    }

    zone.iter()
        .find_map(|l| STANDALONE.captures(l).and_then(|c| c[1].parse().ok()))
}

/// Reading order from `(physical, printed)` pairs.
///
/// Numbered pages come first, ascending by printed number with ties kept in
/// physical order; unnumbered pages follow in physical order. The result is
/// expressed in physical page numbers.
pub fn order_by_printed_numbers(pages: &[(u32, Option<u32>)]) -> Vec<u32> {
    let mut scan: Vec<(u32, Option<u32>)> = pages.to_vec();
    scan.sort_by_key(|&(physical, _)| physical);

    let mut numbered: Vec<(u32, u32)> = scan
        .iter()
        .filter_map(|&(physical, printed)| printed.map(|n| (n, physical)))
        .collect();
    // Stable: equal printed numbers keep scan order.
    numbered.sort_by_key(|&(printed, _)| printed);

    numbered
        .into_iter()
        .map(|(_, physical)| physical)
        .chain(
            scan.iter()
                .filter(|(_, printed)| printed.is_none())
                .map(|&(physical, _)| physical),
        )
        .collect()
}

/// Detect printed numbers on `pages` and return their reading order.
pub fn reading_order(pages: &[Page]) -> Vec<u32> {
    let annotated: Vec<(u32, Option<u32>)> = pages
        .iter()
        .map(|p| (p.physical_number, detect_printed_number(&p.text)))
        .collect();
    order_by_printed_numbers(&annotated)
}
