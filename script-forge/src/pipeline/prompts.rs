//! Prompt templates.
//!
//! Templates are plain text with `{{name}}` placeholders. The built-in set
//! covers every step of the fixed pipelines; deployments can replace or add
//! templates by name.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::{Error, Result};

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([a-z_]+)\s*\}\}").unwrap())
}

/// A system/user prompt pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptTemplate {
    #[serde(default)]
    pub system: Option<String>,
    pub user: String,
}

impl PromptTemplate {
    pub fn new(system: Option<&str>, user: &str) -> Self {
        Self {
            system: system.map(str::to_string),
            user: user.to_string(),
        }
    }
}

/// A rendered prompt ready for submission.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedPrompt {
    pub system: Option<String>,
    pub user: String,
}

/// Values substituted into a template.
#[derive(Debug, Clone, Default)]
pub struct PromptVars {
    values: HashMap<&'static str, String>,
}

impl PromptVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.values.insert(name, value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }
}

/// Named template registry.
#[derive(Debug, Clone)]
pub struct PromptTemplates {
    templates: HashMap<String, PromptTemplate>,
}

impl PromptTemplates {
    /// Empty registry.
    pub fn empty() -> Self {
        Self {
            templates: HashMap::new(),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, template: PromptTemplate) {
        self.templates.insert(name.into(), template);
    }

    pub fn with(mut self, name: impl Into<String>, template: PromptTemplate) -> Self {
        self.insert(name, template);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    /// Render template `name`. Every placeholder must have a value.
    pub fn render(&self, name: &str, vars: &PromptVars) -> Result<RenderedPrompt> {
        let template = self
            .templates
            .get(name)
            .ok_or_else(|| Error::config(format!("unknown prompt template '{}'", name)))?;

        Ok(RenderedPrompt {
            system: template
                .system
                .as_deref()
                .map(|system| substitute(name, system, vars))
                .transpose()?,
            user: substitute(name, &template.user, vars)?,
        })
    }
}

fn substitute(template: &str, text: &str, vars: &PromptVars) -> Result<String> {
    let mut missing = None;
    let rendered = placeholder_regex().replace_all(text, |caps: &regex::Captures<'_>| {
        let key = &caps[1];
        match vars.get(key) {
            Some(value) => value.to_string(),
            None => {
                missing.get_or_insert_with(|| key.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(key) => Err(Error::config(format!(
            "template '{}' needs a value for '{}'",
            template, key
        ))),
        None => Ok(rendered.into_owned()),
    }
}

const SCRIPT_SYSTEM: &str = "You write visual scripts for short-form music videos. \
Answer with exactly the format requested and nothing else.";

impl Default for PromptTemplates {
    fn default() -> Self {
        Self::empty()
            .with(
                "image_prompts",
                PromptTemplate::new(
                    Some(SCRIPT_SYSTEM),
                    "Song: {{topic}}\n\nLyrics:\n{{lyrics}}\n\n\
                     Write one image prompt per lyric line. \
                     Return a JSON array of strings with exactly one entry per line.",
                ),
            )
            .with(
                "video_prompts",
                PromptTemplate::new(
                    Some(SCRIPT_SYSTEM),
                    "Song: {{topic}}\n\nScenes:\n{{previous}}\n\n\
                     Turn each scene into a short camera-motion video prompt. \
                     Return a JSON array of strings with exactly one entry per scene.",
                ),
            )
            .with(
                "shorten",
                PromptTemplate::new(
                    Some(SCRIPT_SYSTEM),
                    "Rewrite the following {{field}} in at most {{limit}} characters, \
                     keeping its meaning. Return only the rewritten text.\n\n{{text}}",
                ),
            )
            .with(
                "title",
                PromptTemplate::new(
                    Some(SCRIPT_SYSTEM),
                    "Song: {{topic}}\n\nSection:\n{{segment}}\n\n\
                     Write one catchy on-screen title for this section. \
                     Return only the title.",
                ),
            )
            .with(
                "hashtags",
                PromptTemplate::new(
                    Some(SCRIPT_SYSTEM),
                    "Song: {{topic}}\n\nLyrics:\n{{lyrics}}\n\n\
                     Suggest up to 10 hashtags for this video, separated by spaces.",
                ),
            )
            .with(
                "scoring",
                PromptTemplate::new(
                    Some(SCRIPT_SYSTEM),
                    "Song: {{topic}}\n\nScenes:\n{{previous}}\n\n\
                     Rate the hook, visuals and overall virality from 1 to 10. \
                     Return a JSON object with the keys hook, visuals, overall and reason.",
                ),
            )
            .with(
                "enrich_image",
                PromptTemplate::new(
                    Some(SCRIPT_SYSTEM),
                    "Song: {{topic}}\n\nScenes:\n{{segment}}\n\n\
                     Write one image prompt for a cutaway shot that bridges these scenes. \
                     Return only the prompt.",
                ),
            )
            .with(
                "enrich_video",
                PromptTemplate::new(
                    Some(SCRIPT_SYSTEM),
                    "Image prompt:\n{{previous}}\n\n\
                     Turn this image prompt into a short camera-motion video prompt. \
                     Return only the prompt.",
                ),
            )
    }
}
