/// GPU selection helpers shared by the catalog and the CLI.
///
/// Marketplace GPU names are free-form ("RTX 4090", "RTX_4090", "H100 SXM"), so
/// matching is deliberately loose: case-insensitive, `_` treated as a space, and a
/// pattern matches anywhere in the name unless it is anchored with `^`.
pub const DEFAULT_GPU_TYPES: &str = "RTX 4090";

/// Parse comma-separated GPU type patterns.
///
/// - Trims whitespace
/// - Drops empty entries
/// - If input is empty/None, returns the default patterns
pub fn parse_gpu_types(raw: Option<&str>) -> Vec<String> {
    let mut out: Vec<String> = raw
        .unwrap_or("")
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect();

    if out.is_empty() {
        out = DEFAULT_GPU_TYPES
            .split(',')
            .map(|s| s.trim().to_string())
            .collect();
    }

    out
}

fn normalize(s: &str) -> String {
    s.trim()
        .replace('_', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_uppercase()
}

/// Return true if `gpu_name` matches at least one pattern.
///
/// Pattern rules:
/// - Case-insensitive, `_` and runs of whitespace are equivalent
/// - Plain pattern: substring match
/// - `*` matches any substring (parts must appear in order)
/// - Leading `^`: the name must start with the pattern
pub fn gpu_name_matches(gpu_name: &str, patterns: &[String]) -> bool {
    let name = normalize(gpu_name);
    if name.is_empty() {
        return false;
    }

    for pat in patterns {
        let raw = pat.trim();
        let (anchored, raw) = match raw.strip_prefix('^') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };
        let p = normalize(raw);
        if p.is_empty() {
            continue;
        }
        if p == "*" {
            return true;
        }

        let mut idx = 0usize;
        let mut ok = true;
        for (i, part) in p.split('*').map(str::trim).enumerate() {
            if part.is_empty() {
                continue;
            }
            match name[idx..].find(part) {
                Some(pos) if anchored && i == 0 && pos != 0 => {
                    ok = false;
                    break;
                }
                Some(pos) => idx += pos + part.len(),
                None => {
                    ok = false;
                    break;
                }
            }
        }
        if ok {
            return true;
        }
    }

    false
}

/// Case-insensitive substring match on the offer location. No filter means any region.
pub fn region_matches(location: Option<&str>, wanted: Option<&str>) -> bool {
    let Some(wanted) = wanted.map(str::trim).filter(|w| !w.is_empty()) else {
        return true;
    };
    let Some(location) = location else {
        return false;
    };
    location
        .to_ascii_lowercase()
        .contains(&wanted.to_ascii_lowercase())
}
