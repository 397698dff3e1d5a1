use std::sync::OnceLock;

use regex::Regex;

/// Maximum length of the sanitized title fragment embedded in a bot name.
const MAX_SLUG_LEN: usize = 40;

/// Derive the canonical bot name for a pull request: `pr-{number}-{slug}`.
///
/// The slug is a sanitized, length-capped fragment of the PR title and is
/// purely cosmetic: matching a bot back to its PR uses only the embedded
/// number, so a title edit after the bot was created does not orphan it.
pub fn bot_name_for_pr(number: u64, title: &str) -> String {
    let slug = slugify(title);
    if slug.is_empty() {
        format!("pr-{number}")
    } else {
        format!("pr-{number}-{slug}")
    }
}

/// Lowercase the title and collapse runs of non-alphanumeric characters
/// into single dashes.
fn slugify(title: &str) -> String {
    let mut out = String::with_capacity(MAX_SLUG_LEN);
    let mut pending_dash = false;
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c.to_ascii_lowercase());
            if out.len() >= MAX_SLUG_LEN {
                break;
            }
        } else {
            pending_dash = true;
        }
    }
    out
}

static BOT_NAME_RE: OnceLock<Regex> = OnceLock::new();

/// Extract the PR number embedded in a bot name, or `None` when the name
/// does not follow this engine's convention. Bots unrelated to the engine
/// are ignored, not errored.
pub fn pr_number_from_bot_name(name: &str) -> Option<u64> {
    let re = BOT_NAME_RE.get_or_init(|| Regex::new(r"^pr-([0-9]+)(?:-|$)").unwrap());
    re.captures(name).and_then(|caps| caps[1].parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bot_name_for_pr() {
        let cases: &[(u64, &str, &str)] = &[
            (42, "Fix login bug", "pr-42-fix-login-bug"),
            (7, "  Weird -- punctuation!! everywhere?", "pr-7-weird-punctuation-everywhere"),
            (3, "", "pr-3"),
            (3, "----", "pr-3"),
            (9, "UPPER Case Title", "pr-9-upper-case-title"),
            (1, "héllo wörld", "pr-1-h-llo-w-rld"),
        ];
        for &(number, title, expected) in cases {
            assert_eq!(bot_name_for_pr(number, title), expected, "#{number} {title:?}");
        }
    }

    #[test]
    fn test_bot_name_is_stable() {
        assert_eq!(bot_name_for_pr(42, "Fix login bug"), bot_name_for_pr(42, "Fix login bug"));
        // A retitled PR still matches by number.
        let renamed = bot_name_for_pr(42, "Fix login bug (for real this time)");
        assert_eq!(pr_number_from_bot_name(&renamed), Some(42));
        assert_eq!(pr_number_from_bot_name("pr-42-fix-login-bug"), Some(42));
    }

    #[test]
    fn test_bot_name_length_cap() {
        let name = bot_name_for_pr(5, &"long title word ".repeat(50));
        assert!(name.len() <= "pr-5-".len() + MAX_SLUG_LEN + 1);
    }

    #[test]
    fn test_pr_number_from_bot_name() {
        let cases: &[(&str, Option<u64>)] = &[
            ("pr-42-fix-login-bug", Some(42)),
            ("pr-42", Some(42)),
            ("pr-007-zeroes", Some(7)),
            ("pr-42x", None),
            ("pr--42", None),
            ("PR-42-case-sensitive", None),
            ("nightly", None),
            ("template-bot", None),
            ("pr-", None),
            ("", None),
        ];
        for &(name, expected) in cases {
            assert_eq!(pr_number_from_bot_name(name), expected, "{name:?}");
        }
    }
}
