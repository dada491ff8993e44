//! Prompt templates for LLM pairwise judging.
//!
//! Provider-agnostic. A template renders one prompt and two candidate
//! completions into chat messages that ask for the identifier (`0` or `1`)
//! of the better completion.

use std::borrow::Cow;

use crate::gateway::Message;

pub const PROMPT_PLACEHOLDER: &str = "{prompt}";
pub const RESPONSE0_PLACEHOLDER: &str = "{response0}";
pub const RESPONSE1_PLACEHOLDER: &str = "{response1}";

/// Rendered prompt ready for the LLM.
#[derive(Debug, Clone)]
pub struct PromptInstance {
    pub template_slug: String,
    pub system: String,
    pub user: String,
}

impl PromptInstance {
    pub fn to_messages(&self) -> Vec<Message> {
        if self.system.is_empty() {
            return vec![Message::user(&self.user)];
        }
        vec![Message::system(&self.system), Message::user(&self.user)]
    }
}

/// Escape XML special characters so completions cannot close our tags.
fn escape_xml_chars(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Substitute placeholders in a single left-to-right pass. Substituted text
/// is never rescanned.
fn fill_placeholders(text: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        match values.iter().find(|(key, _)| tail.starts_with(key)) {
            Some((key, value)) => {
                out.push_str(value);
                rest = &tail[key.len()..];
            }
            None => {
                out.push('{');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// A judging template. Placeholders may appear in either part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    pub slug: Cow<'static, str>,
    pub system: Cow<'static, str>,
    pub user: Cow<'static, str>,
}

impl PromptTemplate {
    /// Build a caller-supplied template.
    ///
    /// Fails unless all three placeholders appear somewhere in the template.
    pub fn custom(
        slug: impl Into<String>,
        system: impl Into<String>,
        user: impl Into<String>,
    ) -> Result<Self, String> {
        let template = Self {
            slug: Cow::Owned(slug.into()),
            system: Cow::Owned(system.into()),
            user: Cow::Owned(user.into()),
        };
        let missing: Vec<&str> = [PROMPT_PLACEHOLDER, RESPONSE0_PLACEHOLDER, RESPONSE1_PLACEHOLDER]
            .into_iter()
            .filter(|p| !template.system.contains(p) && !template.user.contains(p))
            .collect();
        if !missing.is_empty() {
            return Err(format!(
                "template '{}' is missing placeholders: {}",
                template.slug,
                missing.join(", ")
            ));
        }
        Ok(template)
    }

    pub fn render(&self, prompt: &str, response0: &str, response1: &str) -> PromptInstance {
        let safe_prompt = escape_xml_chars(prompt.trim());
        let safe_r0 = escape_xml_chars(response0.trim());
        let safe_r1 = escape_xml_chars(response1.trim());

        let values = [
            (PROMPT_PLACEHOLDER, safe_prompt.as_str()),
            (RESPONSE0_PLACEHOLDER, safe_r0.as_str()),
            (RESPONSE1_PLACEHOLDER, safe_r1.as_str()),
        ];
        let fill = |text: &str| fill_placeholders(text, &values);

        PromptInstance {
            template_slug: self.slug.to_string(),
            system: fill(&self.system).trim().to_string(),
            user: fill(&self.user).trim().to_string(),
        }
    }

    /// Stable fingerprint of the template text, used in cache keys.
    pub fn hash(&self) -> String {
        blake3::hash(format!("{}\n{}", self.system, self.user).as_bytes())
            .to_hex()
            .to_string()
    }
}

// =============================================================================
// Standard prompts
// =============================================================================

pub const PAIRWISE_V1: PromptTemplate = PromptTemplate {
    slug: Cow::Borrowed("pairwise_v1"),
    system: Cow::Borrowed(
        r#"You are ranking outputs of language models for a leaderboard. You will see one instruction and two candidate outputs, each labelled with an identifier. Judge which output a careful human would prefer, considering correctness, relevance and helpfulness. Ignore output order and length.

Reply with the identifier of the better output and nothing else: a single character, `0` or `1`, with no quotes, spaces or newlines."#,
    ),
    user: Cow::Borrowed(
        r#"<instruction>
{prompt}
</instruction>

<output identifier="0">
{response0}
</output>

<output identifier="1">
{response1}
</output>

Identifier of the better output:"#,
    ),
};

pub const DEFAULT_PROMPT: PromptTemplate = PAIRWISE_V1;

// =============================================================================
// TESTS
// =============================================================================
