//! Whitespace-gap detection over 1-D projections.
//!
//! One primitive, three users: the heuristic layout detector cuts pages along
//! empty rows/columns of an ink profile, reading order splits a page into
//! column bands, and the assembler clusters table words into row and column
//! bands. In every case the question is the same: where are the runs of
//! "something", and which gaps between them are wide enough to matter?

/// Runs of indices whose value exceeds `min_ink`, as half-open ranges.
///
/// Runs separated by fewer than `min_gap` empty entries are merged.
pub fn ink_runs(profile: &[u32], min_ink: u32, min_gap: usize) -> Vec<(usize, usize)> {
    let mut runs: Vec<(usize, usize)> = Vec::new();
    let mut start: Option<usize> = None;
    for (i, &v) in profile.iter().enumerate() {
        match (v > min_ink, start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                push_run(&mut runs, (s, i), min_gap);
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        push_run(&mut runs, (s, profile.len()), min_gap);
    }
    runs
}

fn push_run(runs: &mut Vec<(usize, usize)>, run: (usize, usize), min_gap: usize) {
    if let Some(last) = runs.last_mut() {
        if run.0 - last.1 < min_gap {
            last.1 = run.1;
            return;
        }
    }
    runs.push(run);
}

/// Merge `[start, end)` intervals into bands; intervals that overlap or are
/// separated by less than `min_gap` end up in the same band.
///
/// Bands come back sorted by start.
pub fn cluster_intervals(intervals: &[(f32, f32)], min_gap: f32) -> Vec<(f32, f32)> {
    let mut sorted: Vec<(f32, f32)> = intervals
        .iter()
        .copied()
        .filter(|(s, e)| s.is_finite() && e.is_finite() && e >= s)
        .collect();
    sorted.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut bands: Vec<(f32, f32)> = Vec::new();
    for (s, e) in sorted {
        match bands.last_mut() {
            Some(last) if s - last.1 < min_gap => last.1 = last.1.max(e),
            _ => bands.push((s, e)),
        }
    }
    bands
}

/// Index of the band containing `value`, else of the nearest band.
pub fn band_of(bands: &[(f32, f32)], value: f32) -> Option<usize> {
    if let Some(i) = bands.iter().position(|(s, e)| value >= *s && value <= *e) {
        return Some(i);
    }
    bands
        .iter()
        .enumerate()
        .map(|(i, (s, e))| {
            let d = if value < *s { s - value } else { value - e };
            (i, d)
        })
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(i, _)| i)
}
