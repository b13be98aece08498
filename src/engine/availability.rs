use crate::model::*;

// ── Free-window computation ────────────────────────────────────────

/// Free spans of a resource inside `window`: the window minus every active
/// booking (overrun loans stretched through `now`), optionally dropping gaps
/// shorter than `min_duration`.
///
/// A resource that refuses bookings has no free windows at all.
pub fn free_windows(
    rs: &ResourceState,
    window: &Span,
    min_duration: Option<Ms>,
    now: Ms,
) -> Vec<Span> {
    if !rs.admits_bookings() {
        return Vec::new();
    }
    let mut claimed: Vec<Span> = rs
        .occupying(window, now)
        .map(|b| {
            let occupied = b.occupied_span(now);
            Span::new(occupied.start.max(window.start), occupied.end.min(window.end))
        })
        .collect();
    claimed.sort_by_key(|s| s.start);
    let claimed = merge_overlapping(&claimed);
    let mut free = subtract_intervals(&[*window], &claimed);
    if let Some(min) = min_duration {
        free.retain(|s| s.duration_ms() >= min);
    }
    free
}

/// Merge sorted spans that overlap or touch.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// `base - to_remove`, both sorted and internally disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut cursor = b.start;

        while ri < to_remove.len() && to_remove[ri].end <= cursor {
            ri += 1;
        }

        for r in to_remove[ri..].iter().take_while(|r| r.start < b.end) {
            if r.start > cursor {
                result.push(Span::new(cursor, r.start));
            }
            cursor = cursor.max(r.end);
        }

        if cursor < b.end {
            result.push(Span::new(cursor, b.end));
        }
    }

    result
}
