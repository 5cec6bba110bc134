//! Line-oriented diff used for human-readable body mismatches.

/// Above this many LCS cells the middle section is reported as a plain
/// remove-all/add-all block.
const MAX_LCS_CELLS: usize = 4_000_000;

enum Line<'a> {
    Same(&'a str),
    Removed(&'a str),
    Added(&'a str),
}

/// Renders `expected` vs `actual` as `-`/`+`/` ` prefixed lines. Returns an
/// empty string when both sides are identical.
pub fn line_diff(expected: &str, actual: &str) -> String {
    if expected == actual {
        return String::new();
    }

    let old: Vec<&str> = expected.lines().collect();
    let new: Vec<&str> = actual.lines().collect();

    let prefix = old.iter().zip(&new).take_while(|(a, b)| a == b).count();
    let suffix = old[prefix..]
        .iter()
        .rev()
        .zip(new[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();

    let old_mid = &old[prefix..old.len() - suffix];
    let new_mid = &new[prefix..new.len() - suffix];

    let mut lines: Vec<Line<'_>> = old[..prefix].iter().map(|l| Line::Same(l)).collect();
    lines.extend(diff_middle(old_mid, new_mid));
    lines.extend(old[old.len() - suffix..].iter().map(|l| Line::Same(l)));

    let mut out = String::from("--- expected\n+++ actual\n");
    for line in lines {
        let (marker, text) = match line {
            Line::Same(text) => (' ', text),
            Line::Removed(text) => ('-', text),
            Line::Added(text) => ('+', text),
        };
        out.push(marker);
        out.push(' ');
        out.push_str(text);
        out.push('\n');
    }

    // Same lines, different trailing newline.
    if !out.contains("\n- ") && !out.contains("\n+ ") {
        out.push_str("(trailing newline differs)\n");
    }
    out
}

fn diff_middle<'a>(old: &[&'a str], new: &[&'a str]) -> Vec<Line<'a>> {
    if old.len().saturating_mul(new.len()) > MAX_LCS_CELLS {
        return old
            .iter()
            .map(|l| Line::Removed(l))
            .chain(new.iter().map(|l| Line::Added(l)))
            .collect();
    }

    let (n, m) = (old.len(), new.len());
    let mut table = vec![vec![0u32; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            table[i][j] = if old[i] == new[j] {
                table[i + 1][j + 1] + 1
            } else {
                table[i + 1][j].max(table[i][j + 1])
            };
        }
    }

    let mut lines = Vec::with_capacity(n + m);
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if old[i] == new[j] {
            lines.push(Line::Same(old[i]));
            i += 1;
            j += 1;
        } else if table[i + 1][j] >= table[i][j + 1] {
            lines.push(Line::Removed(old[i]));
            i += 1;
        } else {
            lines.push(Line::Added(new[j]));
            j += 1;
        }
    }
    lines.extend(old[i..].iter().map(|l| Line::Removed(l)));
    lines.extend(new[j..].iter().map(|l| Line::Added(l)));
    lines
}
