//! Line-based markdown normalizer.
//!
//! Grounded in the original's `format_markdown_response`: a single
//! line-by-line pass tracking `{in_code_block, list_type, counter}`, then a
//! second pass that fixes header spacing (skipping fenced code) and
//! collapses runs of blank lines. Fenced code blocks are never mutated.

use regex::Regex;

#[derive(PartialEq)]
enum ListType {
    None,
    Bullet,
    Ordered,
}

/// Normalize bullets/numbering/spacing while leaving fenced code verbatim.
pub fn normalize(content: &str) -> String {
    let bullet_re = Regex::new(r"^[-*•]\s+(.+)$").unwrap();
    let numbered_re = Regex::new(r"^(\d+)[.)]\s+(.+)$").unwrap();

    let mut out: Vec<String> = Vec::new();
    let mut in_code_block = false;
    let mut list_type = ListType::None;
    let mut counter: u32 = 0;

    for line in content.lines() {
        let trimmed = line.trim_start();

        if trimmed.starts_with("```") {
            in_code_block = !in_code_block;
            out.push(line.to_string());
            continue;
        }

        if in_code_block || line.starts_with("    ") || line.starts_with('\t') {
            out.push(line.to_string());
            continue;
        }

        if let Some(caps) = bullet_re.captures(trimmed) {
            if list_type == ListType::None {
                if let Some(last) = out.last() {
                    if !last.trim().is_empty() {
                        out.push(String::new());
                    }
                }
            }
            list_type = ListType::Bullet;
            out.push(format!("- {}", &caps[1]));
            continue;
        }

        if let Some(caps) = numbered_re.captures(trimmed) {
            if list_type == ListType::None {
                if let Some(last) = out.last() {
                    if !last.trim().is_empty() {
                        out.push(String::new());
                    }
                }
                counter = caps[1].parse().unwrap_or(1);
            } else if list_type != ListType::Ordered {
                counter = caps[1].parse().unwrap_or(1);
            } else {
                counter += 1;
            }
            list_type = ListType::Ordered;
            out.push(format!("{counter}. {}", &caps[2]));
            continue;
        }

        if list_type != ListType::None {
            let indented = line.len() - trimmed.len() >= 2;
            if !trimmed.is_empty() && !indented {
                list_type = ListType::None;
                if let Some(last) = out.last() {
                    if !last.trim().is_empty() {
                        out.push(String::new());
                    }
                }
            }
        }

        if trimmed.is_empty() {
            if out.last().map(|l| l.trim().is_empty()).unwrap_or(false) {
                continue;
            }
        }

        out.push(line.to_string());
    }

    let joined = out.join("\n");
    apply_spacing_fixes(&joined)
}

/// Second pass: header spacing (only outside fenced code) and blank-line
/// collapsing, split on code-block boundaries so fences are never touched.
fn apply_spacing_fixes(content: &str) -> String {
    let fence_re = Regex::new(r"(?s)(```.*?```)").unwrap();
    let header_re = Regex::new(r"(?m)^(#{1,6}\s+.+)\n([^\n#\s])").unwrap();

    let mut rebuilt = String::new();
    let mut last_end = 0;
    for m in fence_re.find_iter(content) {
        let before = &content[last_end..m.start()];
        rebuilt.push_str(&header_re.replace_all(before, "$1\n\n$2"));
        rebuilt.push_str(m.as_str());
        last_end = m.end();
    }
    rebuilt.push_str(&header_re.replace_all(&content[last_end..], "$1\n\n$2"));

    let blank_run_re = Regex::new(r"\n{4,}").unwrap();
    let collapsed = blank_run_re.replace_all(&rebuilt, "\n\n\n");

    let before_list_re = Regex::new(r"(?m)^([^\n])\n([-*]|\d+[.)])").unwrap();
    before_list_re.replace_all(&collapsed, "$1\n\n$2").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_mixed_bullet_markers() {
        let input = "Intro\n* one\n- two\n• three";
        let out = normalize(input);
        assert!(out.contains("- one"));
        assert!(out.contains("- two"));
        assert!(out.contains("- three"));
    }

    #[test]
    fn preserves_fenced_code_block_verbatim() {
        let input = "Text\n```\n* not a bullet\n```\nMore text";
        let out = normalize(input);
        assert!(out.contains("* not a bullet"));
    }

    #[test]
    fn collapses_long_runs_of_blank_lines() {
        let input = "a\n\n\n\n\n\nb";
        let out = normalize(input);
        assert!(!out.contains("\n\n\n\n"));
    }

    #[test]
    fn preserves_ordered_list_counter() {
        let input = "5. five\n6. six";
        let out = normalize(input);
        assert!(out.contains("5. five"));
        assert!(out.contains("6. six"));
    }
}
