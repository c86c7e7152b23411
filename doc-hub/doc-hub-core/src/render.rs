//! Turns stored text into previewable HTML.
//!
//! Markdown goes through pulldown-cmark with a heading pass that assigns
//! anchor ids and builds an outline; other text formats are syntax highlighted
//! with syntect. Rendering never fails: text we know but cannot highlight is
//! shown verbatim, anything else is [`RenderResult::Unsupported`].

use std::collections::HashSet;
use std::fmt::Write;
use std::sync::OnceLock;

use pulldown_cmark::{html, CowStr, Event, Options, Parser, Tag, TagEnd};
use serde::Serialize;
use syntect::easy::HighlightLines;
use syntect::highlighting::{Theme, ThemeSet};
use syntect::html::{styled_line_to_highlighted_html, IncludeBackground};
use syntect::parsing::{SyntaxReference, SyntaxSet};
use syntect::util::LinesWithEndings;

const MARKDOWN_EXTENSIONS: &[&str] = &["md", "markdown"];
const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "rs", "py", "js", "ts", "json", "html", "css", "c", "h", "cpp", "java", "go", "sh",
    "yaml", "yml", "toml", "xml", "sql", "ini", "cfg", "log", "csv", "rb", "php", "lua",
];
const THEME: &str = "InspiredGitHub";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OutlineEntry {
    pub level: u8,
    pub text: String,
    pub id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RenderResult {
    Unsupported,
    Markdown {
        html: String,
        outline: Vec<OutlineEntry>,
    },
    Highlighted {
        html: String,
    },
}

fn normalize_extension(extension: &str) -> String {
    extension.trim_start_matches('.').to_ascii_lowercase()
}

pub fn is_markdown(extension: &str) -> bool {
    MARKDOWN_EXTENSIONS.contains(&normalize_extension(extension).as_str())
}

/// Whether files with this extension get a preview at all.
pub fn is_previewable(extension: &str) -> bool {
    let ext = normalize_extension(extension);
    MARKDOWN_EXTENSIONS.contains(&ext.as_str()) || TEXT_EXTENSIONS.contains(&ext.as_str())
}

pub fn render(content: &str, extension: &str) -> RenderResult {
    let ext = normalize_extension(extension);
    if MARKDOWN_EXTENSIONS.contains(&ext.as_str()) {
        let (html, outline) = render_markdown(content);
        RenderResult::Markdown { html, outline }
    } else if TEXT_EXTENSIONS.contains(&ext.as_str()) {
        RenderResult::Highlighted {
            html: highlight(content, &ext),
        }
    } else {
        RenderResult::Unsupported
    }
}

fn markdown_options() -> Options {
    Options::ENABLE_TABLES
        | Options::ENABLE_FOOTNOTES
        | Options::ENABLE_STRIKETHROUGH
        | Options::ENABLE_TASKLISTS
        | Options::ENABLE_SMART_PUNCTUATION
        | Options::ENABLE_DEFINITION_LIST
}

fn render_markdown(content: &str) -> (String, Vec<OutlineEntry>) {
    let events: Vec<Event<'_>> = Parser::new_ext(content, markdown_options()).collect();
    let mut ids = HeadingIds::default();
    let mut outline = Vec::new();
    let mut out: Vec<Event<'_>> = Vec::with_capacity(events.len());
    let mut toc_slots = Vec::new();

    let mut i = 0;
    while i < events.len() {
        match &events[i] {
            Event::Start(Tag::Heading { level, .. }) => {
                if let Some(end) = closing(&events, i, |e| matches!(e, Event::End(TagEnd::Heading(_)))) {
                    let level = *level as u8;
                    let inner = &events[i + 1..end];
                    let text = plain_text(inner);
                    let id = ids.assign(&text);
                    out.push(Event::Html(CowStr::from(format!("<h{level} id=\"{id}\">"))));
                    out.extend(inner.iter().cloned());
                    // the self-link trails the text so links inside the heading never nest
                    out.push(Event::Html(CowStr::from(format!(
                        "<a class=\"heading-anchor\" href=\"#{id}\">\u{b6}</a></h{level}>\n"
                    ))));
                    outline.push(OutlineEntry { level, text, id });
                    i = end + 1;
                    continue;
                }
            }
            Event::Start(Tag::Paragraph) => {
                if let Some(end) = toc_marker(&events, i) {
                    toc_slots.push(out.len());
                    out.push(Event::Html(CowStr::Borrowed("")));
                    i = end + 1;
                    continue;
                }
            }
            _ => {}
        }
        out.push(events[i].clone());
        i += 1;
    }

    if !toc_slots.is_empty() {
        let toc = toc_html(&outline);
        for slot in toc_slots {
            out[slot] = Event::Html(CowStr::from(toc.clone()));
        }
    }

    let mut html_out = String::with_capacity(content.len() * 3 / 2);
    html::push_html(&mut html_out, out.into_iter());
    (html_out, outline)
}

fn closing(events: &[Event<'_>], start: usize, is_end: impl Fn(&Event<'_>) -> bool) -> Option<usize> {
    events[start + 1..]
        .iter()
        .position(is_end)
        .map(|offset| start + 1 + offset)
}

/// A paragraph whose only content is `[TOC]` marks where the table of contents
/// goes. Returns the index of the paragraph's end event.
fn toc_marker(events: &[Event<'_>], start: usize) -> Option<usize> {
    let end = closing(events, start, |e| matches!(e, Event::End(TagEnd::Paragraph)))?;
    let mut text = String::new();
    for event in &events[start + 1..end] {
        match event {
            Event::Text(t) => text.push_str(t),
            _ => return None,
        }
    }
    (text.trim() == "[TOC]").then_some(end)
}

fn plain_text(events: &[Event<'_>]) -> String {
    let mut text = String::new();
    for event in events {
        match event {
            Event::Text(t) | Event::Code(t) => text.push_str(t),
            Event::SoftBreak | Event::HardBreak => text.push(' '),
            _ => {}
        }
    }
    text.trim().to_string()
}

fn toc_html(outline: &[OutlineEntry]) -> String {
    let mut html = String::from("<div class=\"toc\">\n");
    let mut open: Vec<u8> = Vec::new();
    for entry in outline {
        while open.last().is_some_and(|&top| top > entry.level) {
            html.push_str("</li>\n</ul>\n");
            open.pop();
        }
        match open.last() {
            Some(&top) if top == entry.level => html.push_str("</li>\n"),
            _ => {
                html.push_str("<ul>\n");
                open.push(entry.level);
            }
        }
        let _ = write!(html, "<li><a href=\"#{}\">{}</a>", entry.id, escape_html(&entry.text));
    }
    while open.pop().is_some() {
        html.push_str("</li>\n</ul>\n");
    }
    html.push_str("</div>\n");
    html
}

/// Hands out heading ids in document order, suffixing repeats with `_1`, `_2`, ...
#[derive(Default)]
struct HeadingIds {
    used: HashSet<String>,
}

impl HeadingIds {
    fn assign(&mut self, text: &str) -> String {
        let base = slugify(text);
        let mut candidate = base.clone();
        let mut n = 0;
        while self.used.contains(&candidate) {
            n += 1;
            candidate = format!("{base}_{n}");
        }
        self.used.insert(candidate.clone());
        candidate
    }
}

fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut separator = false;
    for c in text.chars() {
        if c.is_alphanumeric() || c == '_' {
            if separator && !slug.is_empty() {
                slug.push('-');
            }
            separator = false;
            slug.push(c);
        } else if c == '-' || c.is_whitespace() {
            separator = true;
        }
    }
    if slug.is_empty() {
        slug.push_str("section");
    }
    slug
}

fn syntaxes() -> &'static SyntaxSet {
    static SYNTAXES: OnceLock<SyntaxSet> = OnceLock::new();
    SYNTAXES.get_or_init(SyntaxSet::load_defaults_newlines)
}

fn theme() -> &'static Theme {
    static THEME_CELL: OnceLock<Theme> = OnceLock::new();
    THEME_CELL.get_or_init(|| {
        let mut set = ThemeSet::load_defaults();
        set.themes.remove(THEME).unwrap_or_default()
    })
}

fn highlight(content: &str, ext: &str) -> String {
    let set = syntaxes();
    let Some(syntax) = set.find_syntax_by_extension(ext) else {
        return verbatim(content);
    };
    match highlight_lines(content, syntax, set) {
        Ok(html) => html,
        Err(e) => {
            tracing::debug!(ext, error = %e, "highlighting failed, showing text verbatim");
            verbatim(content)
        }
    }
}

fn highlight_lines(
    content: &str,
    syntax: &SyntaxReference,
    set: &SyntaxSet,
) -> Result<String, syntect::Error> {
    let mut highlighter = HighlightLines::new(syntax, theme());
    let mut html = String::from("<table class=\"highlight\"><tbody>\n");
    for (n, line) in LinesWithEndings::from(content).enumerate() {
        let ranges = highlighter.highlight_line(line, set)?;
        let code = styled_line_to_highlighted_html(&ranges[..], IncludeBackground::No)?;
        let _ = writeln!(
            html,
            "<tr><td class=\"lineno\">{}</td><td class=\"code\"><pre>{}</pre></td></tr>",
            n + 1,
            code
        );
    }
    html.push_str("</tbody></table>\n");
    Ok(html)
}

fn verbatim(content: &str) -> String {
    format!("<pre class=\"verbatim\">{}</pre>\n", escape_html(content))
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn markdown(content: &str) -> (String, Vec<OutlineEntry>) {
        match render(content, ".md") {
            RenderResult::Markdown { html, outline } => (html, outline),
            other => panic!("expected markdown, got {other:?}"),
        }
    }

    #[test]
    fn title_gets_anchored_heading() {
        let (html, outline) = markdown("# Title\nbody");
        assert_eq!(
            outline,
            vec![OutlineEntry {
                level: 1,
                text: "Title".into(),
                id: "Title".into()
            }]
        );
        assert!(html.contains("<h1 id=\"Title\">Title<a class=\"heading-anchor\" href=\"#Title\">\u{b6}</a></h1>"));
        assert!(html.contains("<p>body</p>"));
    }

    #[test]
    fn links_in_headings_are_not_nested() {
        let (html, outline) = markdown("## See [docs](https://example.org)\n");
        assert_eq!(outline[0].id, "See-docs");
        assert!(html.contains(
            "<h2 id=\"See-docs\">See <a href=\"https://example.org\">docs</a>\
             <a class=\"heading-anchor\" href=\"#See-docs\">\u{b6}</a></h2>"
        ));
        assert!(!html.contains("<a class=\"heading-anchor\" href=\"#See-docs\"><h2"));
    }

    #[test]
    fn duplicate_headings_are_numbered_in_order() {
        let (_, outline) = markdown("# Intro\n\n## Intro\n\n# Intro\n\n### Other\n");
        let ids: Vec<_> = outline.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, ["Intro", "Intro_1", "Intro_2", "Other"]);
        let levels: Vec<_> = outline.iter().map(|e| e.level).collect();
        assert_eq!(levels, [1, 2, 1, 3]);
    }

    #[test]
    fn rendering_is_deterministic() {
        let doc = "# A\n\n## A\n\n[TOC]\n\n| x | y |\n|---|---|\n| 1 | 2 |\n\n# A b-c\n";
        assert_eq!(render(doc, "md"), render(doc, "md"));
    }

    #[test]
    fn slugs_strip_and_collapse() {
        assert_eq!(slugify("Hello, World!"), "Hello-World");
        assert_eq!(slugify("  a -- b  "), "a-b");
        assert_eq!(slugify("snake_case id"), "snake_case-id");
        assert_eq!(slugify("第一章 开始"), "第一章-开始");
        assert_eq!(slugify("?!"), "section");
    }

    #[test]
    fn heading_text_includes_inline_code() {
        let (_, outline) = markdown("## Using `render` *now*\n");
        assert_eq!(outline[0].text, "Using render now");
        assert_eq!(outline[0].id, "Using-render-now");
    }

    #[test]
    fn toc_marker_becomes_nested_list() {
        let (html, _) = markdown("[TOC]\n\n# One\n\n## Two\n\n# Three\n");
        assert!(!html.contains("[TOC]"));
        assert!(html.contains("<div class=\"toc\">"));
        let one = html.find("href=\"#One\"").unwrap();
        let two = html.find("href=\"#Two\"").unwrap();
        let three = html.find("href=\"#Three\"").unwrap();
        assert!(one < two && two < three);
        assert!(html.contains("<ul>\n<li><a href=\"#Two\">Two</a></li>\n</ul>"));
    }

    #[test]
    fn markdown_extensions_are_enabled() {
        let (html, _) = markdown(
            "| a | b |\n|---|---|\n| 1 | 2 |\n\nSee[^n].\n\n[^n]: a note\n\n\"quoted\"\n\nTerm\n: Definition\n\n```rust\nfn main() {}\n```\n",
        );
        assert!(html.contains("<table>"));
        assert!(html.contains("footnote"));
        assert!(html.contains('\u{201c}'));
        assert!(html.contains("<dl>"));
        assert!(html.contains("<code class=\"language-rust\">"));
    }

    #[test]
    fn code_is_highlighted_with_line_numbers() {
        match render("fn main() {}\nlet x = 1;\n", "rs") {
            RenderResult::Highlighted { html } => {
                assert!(html.contains("<td class=\"lineno\">1</td>"));
                assert!(html.contains("<td class=\"lineno\">2</td>"));
                assert!(html.contains("<span"));
            }
            other => panic!("expected highlighted, got {other:?}"),
        }
    }

    #[test]
    fn unknown_syntax_falls_back_to_verbatim() {
        assert_eq!(
            highlight("level=<warn> & more", "no-such-syntax"),
            "<pre class=\"verbatim\">level=&lt;warn&gt; &amp; more</pre>\n"
        );
    }

    #[test]
    fn unsupported_extensions() {
        assert_eq!(render("\u{0}\u{1}", "png"), RenderResult::Unsupported);
        assert_eq!(render("x", ""), RenderResult::Unsupported);
        assert!(is_previewable(".MD"));
        assert!(is_markdown("Markdown"));
        assert!(!is_previewable("exe"));
    }
}
