//! Canonical subject keys: reply/forward prefixes are stripped
//! repeatedly (English and Chinese, including `Re[2]:` counters and
//! fullwidth colons), so every message of a thread maps to the same run.

/// Strip all reply/forward prefixes; the remainder is the subject key.
pub fn subject_key(subject: &str) -> String {
    let mut s = subject.trim();
    while let Some(rest) = strip_one_prefix(s) {
        s = rest.trim_start();
    }
    s.trim().to_string()
}

/// Key normalized for matching against run titles.
pub fn normalized_subject(subject: &str) -> String {
    subject_key(subject)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn strip_one_prefix(s: &str) -> Option<&str> {
    // English prefixes, case-insensitive, with an optional [N] counter.
    let lower = s.to_lowercase();
    for prefix in ["fwd", "fw", "re"] {
        if !lower.starts_with(prefix) {
            continue;
        }
        let mut rest = &s[prefix.len()..];
        if let Some(bracketed) = rest.strip_prefix('[') {
            let end = bracketed.find(']')?;
            if end == 0 || !bracketed[..end].chars().all(|c| c.is_ascii_digit()) {
                continue;
            }
            rest = &bracketed[end + 1..];
        }
        if let Some(after) = strip_colon(rest) {
            return Some(after);
        }
    }

    // Chinese prefixes.
    for prefix in ["回复", "转发", "答复"] {
        if let Some(rest) = s.strip_prefix(prefix) {
            if let Some(after) = strip_colon(rest) {
                return Some(after);
            }
        }
    }
    None
}

fn strip_colon(s: &str) -> Option<&str> {
    let s = s.trim_start();
    s.strip_prefix(':').or_else(|| s.strip_prefix('：'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_subject_unchanged() {
        assert_eq!(subject_key("Deploy plan"), "Deploy plan");
    }

    #[test]
    fn single_english_prefixes() {
        assert_eq!(subject_key("Re: Deploy plan"), "Deploy plan");
        assert_eq!(subject_key("RE: Deploy plan"), "Deploy plan");
        assert_eq!(subject_key("Fw: Deploy plan"), "Deploy plan");
        assert_eq!(subject_key("Fwd: Deploy plan"), "Deploy plan");
    }

    #[test]
    fn counter_prefix() {
        assert_eq!(subject_key("Re[2]: Deploy plan"), "Deploy plan");
        assert_eq!(subject_key("Re[10]: Deploy plan"), "Deploy plan");
        // Not a counter: left alone.
        assert_eq!(subject_key("Re[x]: odd"), "Re[x]: odd");
    }

    #[test]
    fn stacked_prefixes_stripped_repeatedly() {
        assert_eq!(subject_key("Re: Fwd: Re: Deploy plan"), "Deploy plan");
        assert_eq!(subject_key("回复: Re: Deploy plan"), "Deploy plan");
    }

    #[test]
    fn chinese_prefixes_and_fullwidth_colon() {
        assert_eq!(subject_key("回复：部署计划"), "部署计划");
        assert_eq!(subject_key("转发: 部署计划"), "部署计划");
        assert_eq!(subject_key("答复：Re：部署计划"), "部署计划");
    }

    #[test]
    fn words_starting_with_re_untouched() {
        assert_eq!(subject_key("Reminder: standup"), "Reminder: standup");
        assert_eq!(subject_key("Forward progress"), "Forward progress");
    }

    #[test]
    fn normalization_folds_case_and_whitespace() {
        assert_eq!(normalized_subject("Re:  Deploy   Plan "), "deploy plan");
        assert_eq!(normalized_subject("Deploy plan"), normalized_subject("RE: deploy PLAN"));
    }
}
