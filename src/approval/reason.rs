//! Reason templates for access requests.
//!
//! A template is plain text with `{placeholder}` fields, parsed once at
//! startup so that an unknown placeholder is a configuration error rather than
//! a surprise at request time. `{{` and `}}` produce literal braces.
//!
//! A template must always render non-empty: it needs visible literal text or
//! a placeholder that is never blank (`organization`, `repository`,
//! `environment`, `run_id`).

use std::fmt::Write as _;

use thiserror::Error;

pub const DEFAULT_REASON_TEMPLATE: &str = "GitHub Actions deployment approval for \
{organization}/{repository} environment {environment}: workflow \"{workflow_name}\" \
run {run_id} requested by {requester} ({url})";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("unknown placeholder {{{0}}} in reason template")]
    UnknownPlaceholder(String),

    #[error("unterminated placeholder at byte {0} in reason template")]
    Unterminated(usize),

    #[error("unmatched '}}' at byte {0} in reason template")]
    UnmatchedClose(usize),

    #[error("reason template can render an empty reason")]
    Blank,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Organization,
    Repository,
    WorkflowName,
    Url,
    Environment,
    RunId,
    Requester,
}

impl Field {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "organization" => Field::Organization,
            "repository" => Field::Repository,
            "workflow_name" => Field::WorkflowName,
            "url" => Field::Url,
            "environment" => Field::Environment,
            "run_id" => Field::RunId,
            "requester" => Field::Requester,
            _ => return None,
        })
    }

    /// Fields whose value is never empty.
    fn always_present(self) -> bool {
        matches!(
            self,
            Field::Organization | Field::Repository | Field::Environment | Field::RunId
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(Field),
}

/// Values substituted into a template.
#[derive(Debug, Clone, Copy)]
pub struct ReasonContext<'a> {
    pub organization: &'a str,
    pub repository: &'a str,
    pub workflow_name: &'a str,
    pub url: &'a str,
    pub environment: &'a str,
    pub run_id: u64,
    pub requester: &'a str,
}

/// A parsed reason template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReasonTemplate {
    segments: Vec<Segment>,
}

impl ReasonTemplate {
    pub fn parse(template: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = template.char_indices().peekable();

        while let Some((pos, c)) = chars.next() {
            match c {
                '{' if chars.peek().map(|&(_, n)| n) == Some('{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek().map(|&(_, n)| n) == Some('}') => {
                    chars.next();
                    literal.push('}');
                }
                '}' => return Err(TemplateError::UnmatchedClose(pos)),
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some((_, '}')) => break,
                            Some((_, ch)) => name.push(ch),
                            None => return Err(TemplateError::Unterminated(pos)),
                        }
                    }
                    let field = Field::parse(name.trim())
                        .ok_or(TemplateError::UnknownPlaceholder(name))?;
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Field(field));
                }
                c => literal.push(c),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        let renders_text = segments.iter().any(|segment| match segment {
            Segment::Literal(text) => !text.trim().is_empty(),
            Segment::Field(field) => field.always_present(),
        });
        if !renders_text {
            return Err(TemplateError::Blank);
        }
        Ok(ReasonTemplate { segments })
    }

    pub fn render(&self, ctx: &ReasonContext<'_>) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field(Field::Organization) => out.push_str(ctx.organization),
                Segment::Field(Field::Repository) => out.push_str(ctx.repository),
                Segment::Field(Field::WorkflowName) => out.push_str(ctx.workflow_name),
                Segment::Field(Field::Url) => out.push_str(ctx.url),
                Segment::Field(Field::Environment) => out.push_str(ctx.environment),
                Segment::Field(Field::RunId) => {
                    let _ = write!(out, "{}", ctx.run_id);
                }
                Segment::Field(Field::Requester) => out.push_str(ctx.requester),
            }
        }
        out
    }
}

impl Default for ReasonTemplate {
    fn default() -> Self {
        // The built-in template is covered by tests; fall back to fixed text
        // rather than panicking if it ever stops parsing.
        ReasonTemplate::parse(DEFAULT_REASON_TEMPLATE).unwrap_or(ReasonTemplate {
            segments: vec![Segment::Literal("GitHub Actions deployment approval".into())],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ReasonContext<'static> {
        ReasonContext {
            organization: "org",
            repository: "repo",
            workflow_name: "Deploy",
            url: "https://github.com/org/repo/actions/runs/14988928371",
            environment: "build/prod",
            run_id: 14988928371,
            requester: "alice",
        }
    }

    #[test]
    fn default_template_parses_and_renders_every_field() {
        let template = ReasonTemplate::parse(DEFAULT_REASON_TEMPLATE).unwrap();
        assert_eq!(template, ReasonTemplate::default());

        let rendered = template.render(&ctx());
        assert_eq!(
            rendered,
            "GitHub Actions deployment approval for org/repo environment build/prod: \
             workflow \"Deploy\" run 14988928371 requested by alice \
             (https://github.com/org/repo/actions/runs/14988928371)"
        );
    }

    #[test]
    fn escaped_braces_are_literal() {
        let template = ReasonTemplate::parse("{{run}} {run_id} }}").unwrap();
        assert_eq!(template.render(&ctx()), "{run} 14988928371 }");
    }

    #[test]
    fn unknown_placeholder_is_rejected() {
        assert_eq!(
            ReasonTemplate::parse("deploy {branch}"),
            Err(TemplateError::UnknownPlaceholder("branch".to_string()))
        );
    }

    #[test]
    fn malformed_templates_are_rejected() {
        assert_eq!(
            ReasonTemplate::parse("run {run_id"),
            Err(TemplateError::Unterminated(4))
        );
        assert_eq!(
            ReasonTemplate::parse("oops } here"),
            Err(TemplateError::UnmatchedClose(5))
        );
    }

    #[test]
    fn templates_that_can_render_empty_are_rejected() {
        for template in ["", "   ", "\t\n", "{url}", " {workflow_name} {requester} "] {
            assert_eq!(
                ReasonTemplate::parse(template),
                Err(TemplateError::Blank),
                "{template:?}"
            );
        }

        let blank_url = ReasonContext { url: "", ..ctx() };
        let template = ReasonTemplate::parse("{url}{run_id}").unwrap();
        assert_eq!(template.render(&blank_url), "14988928371");
    }

    #[test]
    fn template_without_fields_is_fine() {
        let template = ReasonTemplate::parse("static reason").unwrap();
        assert_eq!(template.render(&ctx()), "static reason");
    }
}
