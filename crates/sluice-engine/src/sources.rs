use std::sync::LazyLock;

use regex::Regex;

use sluice_core::SourceRef;

static TITLED_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*\*([^*]+)\*\*\n\s+(https?://\S+)").unwrap());
static BARE_URL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"https?://\S+").unwrap());

const TRAILING: &[char] = &[')', '.', ',', ';', ']', '}', '>', '"', '\''];

/// Best-effort source references from a search tool's text output.
///
/// `**Title**` followed by an indented URL on the next line gives titled
/// references; if the output has none, every bare URL is taken instead.
pub fn extract_sources(output: &str, max: usize) -> Vec<SourceRef> {
    if max == 0 || output.is_empty() {
        return Vec::new();
    }

    let titled: Vec<SourceRef> = TITLED_URL
        .captures_iter(output)
        .filter_map(|cap| {
            let title = cap.get(1)?.as_str().trim();
            let url = clean_url(cap.get(2)?.as_str());
            Some(SourceRef::titled(title, url))
        })
        .collect();

    let candidates = if titled.is_empty() {
        BARE_URL
            .find_iter(output)
            .map(|m| SourceRef::url(clean_url(m.as_str())))
            .collect()
    } else {
        titled
    };

    let mut out: Vec<SourceRef> = Vec::new();
    for source in candidates {
        if source.url.is_empty() || out.iter().any(|s| s.url == source.url) {
            continue;
        }
        out.push(source);
        if out.len() == max {
            break;
        }
    }
    out
}

/// Outputs are often stringified with escaped whitespace, and URLs pick up
/// punctuation from the surrounding prose.
fn clean_url(raw: &str) -> String {
    let url = raw.trim().replace("\\n", "").replace("\\t", "");
    url.trim_end_matches(TRAILING).to_string()
}
