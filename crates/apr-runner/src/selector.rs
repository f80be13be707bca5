use apr_core::{BugId, MatrixError};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Element {
    Single(u64),
    Range(u64, u64),
}

/// Expands a bug selector (`7`, `1,4,9`, `3-8`, or a mix such as `1,4-6`)
/// into an ascending, duplicate-free list of known bug ids.
///
/// Syntax is checked for every element before any id is looked up, so a
/// malformed selector is always reported as such. When several ids are
/// unknown the smallest one is named.
pub fn select(spec: &str, known: &BTreeSet<BugId>) -> Result<Vec<BugId>, MatrixError> {
    let elements = parse(spec)?;

    let mut first_unknown: Option<u64> = None;
    let mut note_unknown = |id: u64| {
        first_unknown = Some(first_unknown.map_or(id, |cur| cur.min(id)));
    };
    let mut out = BTreeSet::new();
    for element in elements {
        match element {
            Element::Single(id) => {
                if known.contains(&BugId(id)) {
                    out.insert(BugId(id));
                } else {
                    note_unknown(id);
                }
            }
            Element::Range(lo, hi) => {
                // Walk the known ids inside the range; the first gap is the
                // smallest unknown id it covers.
                let mut expected = lo;
                let mut gap = None;
                let mut complete = false;
                for id in known.range(BugId(lo)..=BugId(hi)) {
                    if id.0 != expected {
                        gap = Some(expected);
                        break;
                    }
                    out.insert(*id);
                    if id.0 == hi {
                        complete = true;
                        break;
                    }
                    expected = id.0 + 1;
                }
                if gap.is_none() && !complete {
                    gap = Some(expected);
                }
                if let Some(id) = gap {
                    note_unknown(id);
                }
            }
        }
    }
    if let Some(id) = first_unknown {
        return Err(MatrixError::UnknownBug(BugId(id)));
    }
    Ok(out.into_iter().collect())
}

fn parse(spec: &str) -> Result<Vec<Element>, MatrixError> {
    let invalid = |reason: String| MatrixError::InvalidSelector {
        selector: spec.to_string(),
        reason,
    };
    if spec.trim().is_empty() {
        return Err(invalid("selector is empty".to_string()));
    }
    let mut out = Vec::new();
    for raw in spec.split(',') {
        let part = raw.trim();
        if part.is_empty() {
            return Err(invalid("empty list element".to_string()));
        }
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo = parse_id(lo.trim()).map_err(&invalid)?;
                let hi = parse_id(hi.trim()).map_err(&invalid)?;
                if lo > hi {
                    return Err(invalid(format!("range {}-{} is reversed", lo, hi)));
                }
                out.push(Element::Range(lo, hi));
            }
            None => out.push(Element::Single(parse_id(part).map_err(&invalid)?)),
        }
    }
    Ok(out)
}

fn parse_id(raw: &str) -> Result<u64, String> {
    if raw.is_empty() || !raw.chars().all(|c| c.is_ascii_digit()) {
        return Err(format!("'{}' is not a bug index", raw));
    }
    raw.parse::<u64>()
        .map_err(|e| format!("'{}' is not a bug index: {}", raw, e))
}
