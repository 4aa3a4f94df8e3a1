//! Heading-delimited sections of a markdown document

use pulldown_cmark::{Event, HeadingLevel, Options, Parser, Tag, TagEnd};

/// A run of source text under one heading path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    /// Enclosing heading titles, outermost first
    pub heading_path: Vec<String>,
    /// Source slice, starting with the section's own heading line
    pub text: String,
}

fn level_number(level: HeadingLevel) -> u8 {
    match level {
        HeadingLevel::H1 => 1,
        HeadingLevel::H2 => 2,
        HeadingLevel::H3 => 3,
        HeadingLevel::H4 => 4,
        HeadingLevel::H5 => 5,
        HeadingLevel::H6 => 6,
    }
}

struct HeadingMark {
    level: u8,
    title: String,
    offset: usize,
}

fn find_headings(content: &str) -> Vec<HeadingMark> {
    let mut headings = Vec::new();
    let mut current: Option<(u8, usize, String)> = None;

    for (event, range) in Parser::new_ext(content, Options::ENABLE_TABLES).into_offset_iter() {
        match event {
            Event::Start(Tag::Heading { level, .. }) => {
                current = Some((level_number(level), range.start, String::new()));
            }
            Event::Text(text) | Event::Code(text) => {
                if let Some((_, _, title)) = current.as_mut() {
                    title.push_str(&text);
                }
            }
            Event::End(TagEnd::Heading(_)) => {
                if let Some((level, offset, title)) = current.take() {
                    let title = title.split_whitespace().collect::<Vec<_>>().join(" ");
                    if !title.is_empty() {
                        headings.push(HeadingMark {
                            level,
                            title,
                            offset,
                        });
                    }
                }
            }
            _ => {}
        }
    }
    headings
}

/// Split content at every heading, tracking the enclosing heading path
pub fn split_sections(content: &str) -> Vec<Section> {
    let headings = find_headings(content);
    let mut sections = Vec::new();
    let mut stack: Vec<(u8, String)> = Vec::new();

    let preamble_end = headings.first().map_or(content.len(), |h| h.offset);
    if !content[..preamble_end].trim().is_empty() {
        sections.push(Section {
            heading_path: Vec::new(),
            text: content[..preamble_end].to_string(),
        });
    }

    for (i, heading) in headings.iter().enumerate() {
        while stack.last().is_some_and(|(level, _)| *level >= heading.level) {
            stack.pop();
        }
        stack.push((heading.level, heading.title.clone()));

        let end = headings.get(i + 1).map_or(content.len(), |next| next.offset);
        sections.push(Section {
            heading_path: stack.iter().map(|(_, title)| title.clone()).collect(),
            text: content[heading.offset..end].to_string(),
        });
    }

    sections
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sections_track_heading_path() {
        let content = "Intro line\n\n# Guide\n\nText\n\n## Install\n\nSteps\n\n## Usage\n\nMore\n\n# Appendix\n\nEnd\n";
        let sections = split_sections(content);
        let paths: Vec<Vec<String>> = sections.iter().map(|s| s.heading_path.clone()).collect();
        assert_eq!(
            paths,
            vec![
                vec![],
                vec!["Guide".to_string()],
                vec!["Guide".to_string(), "Install".to_string()],
                vec!["Guide".to_string(), "Usage".to_string()],
                vec!["Appendix".to_string()],
            ]
        );
        assert!(sections[2].text.starts_with("## Install"));
        let rebuilt: String = sections.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(rebuilt, content);
    }

    #[test]
    fn test_headings_inside_code_are_ignored() {
        let content = "# Real\n\n```\n# not a heading\n```\n";
        let sections = split_sections(content);
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].heading_path, vec!["Real".to_string()]);
    }

    #[test]
    fn test_inline_code_in_heading() {
        let sections = split_sections("## The `split` call\nbody");
        assert_eq!(sections[0].heading_path, vec!["The split call".to_string()]);
    }
}
