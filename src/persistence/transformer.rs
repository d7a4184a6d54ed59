use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::persistence::memento::{BrooklynObjectType, MementoDelta, MementoRawData};
use crate::persistence::store::MementoStore;

pub type ContentTransform = Arc<dyn Fn(&str) -> Result<String> + Send + Sync>;

/// A declarative content rewrite, as written in a rules file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum RuleSpec {
    /// Element text or `type`/`class` attribute exactly equal to `from`.
    RenameType { from: String, to: String },
    /// Element name, e.g. `<old.Class>` → `<new.Class>`.
    RenameClassTag { from: String, to: String },
    /// Child element `from` inside any `<class_tag>` element.
    RenameField {
        class_tag: String,
        from: String,
        to: String,
    },
    /// `symbolicName:version` in `<catalogItemId>`.
    ChangeCatalogItemId { from: String, to: String },
    XmlReplaceText { pattern: String, replacement: String },
    DeleteElement { name: String },
}

impl fmt::Display for RuleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleSpec::RenameType { from, to } => write!(f, "rename-type {} -> {}", from, to),
            RuleSpec::RenameClassTag { from, to } => write!(f, "rename-class-tag {} -> {}", from, to),
            RuleSpec::RenameField { class_tag, from, to } => {
                write!(f, "rename-field {}.{} -> {}", class_tag, from, to)
            }
            RuleSpec::ChangeCatalogItemId { from, to } => {
                write!(f, "change-catalog-item-id {} -> {}", from, to)
            }
            RuleSpec::XmlReplaceText { pattern, .. } => write!(f, "xml-replace-text /{}/", pattern),
            RuleSpec::DeleteElement { name } => write!(f, "delete-element {}", name),
        }
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern)
        .map_err(|e| EngineError::IllegalArgument(format!("Invalid pattern '{}': {}", pattern, e)))
}

fn tag_pattern(name: &str) -> Result<Regex> {
    compile(&format!(r"<(/?){}([\s/>])", regex::escape(name)))
}

enum Rule {
    RenameType {
        text: Regex,
        attr: Regex,
        to: String,
    },
    RenameTag {
        tag: Regex,
        to: String,
    },
    RenameField {
        block: Regex,
        field: Regex,
        to: String,
    },
    Replace {
        pattern: Regex,
        replacement: String,
    },
    Delete {
        element: Regex,
    },
    Custom {
        f: ContentTransform,
    },
}

struct NamedRule {
    name: String,
    rule: Rule,
}

impl NamedRule {
    fn compile(spec: &RuleSpec) -> Result<Self> {
        let rule = match spec {
            RuleSpec::RenameType { from, to } => Rule::RenameType {
                text: compile(&format!(r">(\s*){}(\s*)<", regex::escape(from)))?,
                attr: compile(&format!(r#"((?:type|class)=")({})(")"#, regex::escape(from)))?,
                to: to.clone(),
            },
            RuleSpec::RenameClassTag { from, to } => Rule::RenameTag {
                tag: tag_pattern(from)?,
                to: to.clone(),
            },
            RuleSpec::RenameField { class_tag, from, to } => {
                let class = regex::escape(class_tag);
                Rule::RenameField {
                    block: compile(&format!(r"(?s)<{c}(?:\s[^>]*)?>.*?</{c}>", c = class))?,
                    field: tag_pattern(from)?,
                    to: to.clone(),
                }
            }
            RuleSpec::ChangeCatalogItemId { from, to } => Rule::Replace {
                pattern: compile(&format!(
                    r"<catalogItemId>(\s*){}(\s*)</catalogItemId>",
                    regex::escape(from)
                ))?,
                replacement: format!("<catalogItemId>${{1}}{}${{2}}</catalogItemId>", to.replace('$', "$$")),
            },
            RuleSpec::XmlReplaceText {
                pattern,
                replacement,
            } => Rule::Replace {
                pattern: compile(pattern)?,
                replacement: replacement.clone(),
            },
            RuleSpec::DeleteElement { name } => {
                let n = regex::escape(name);
                Rule::Delete {
                    element: compile(&format!(
                        r"(?s)[ \t]*<{n}(?:\s[^>]*)?(?:/>|>.*?</{n}>)[ \t]*\r?\n?",
                        n = n
                    ))?,
                }
            }
        };
        Ok(Self {
            name: spec.to_string(),
            rule,
        })
    }

    fn apply(&self, content: &str) -> Result<String> {
        let out = match &self.rule {
            Rule::RenameType { text, attr, to } => {
                let step = text.replace_all(content, |c: &Captures| format!(">{}{}{}<", &c[1], to, &c[2]));
                attr.replace_all(&step, |c: &Captures| format!("{}{}{}", &c[1], to, &c[3]))
                    .into_owned()
            }
            Rule::RenameTag { tag, to } => rename_tag(tag, to, content),
            Rule::RenameField { block, field, to } => block
                .replace_all(content, |c: &Captures| rename_tag(field, to, &c[0]))
                .into_owned(),
            Rule::Replace {
                pattern,
                replacement,
            } => pattern.replace_all(content, replacement.as_str()).into_owned(),
            Rule::Delete { element } => element.replace_all(content, "").into_owned(),
            Rule::Custom { f } => f(content)?,
        };
        Ok(out)
    }
}

fn rename_tag(tag: &Regex, to: &str, content: &str) -> String {
    tag.replace_all(content, |c: &Captures| format!("<{}{}{}", &c[1], to, &c[2]))
        .into_owned()
}

/// 组合转换器：按固定类型顺序先删除、再逐条改写
///
/// Operates on a snapshot: [`transform`](Self::transform) never touches its
/// input, and [`apply_to_store`](Self::apply_to_store) writes nothing unless
/// every rule succeeded on every object.
#[derive(Default)]
pub struct CompoundTransformer {
    deletions: BTreeMap<BrooklynObjectType, BTreeSet<String>>,
    rules: BTreeMap<BrooklynObjectType, Vec<NamedRule>>,
}

impl fmt::Debug for CompoundTransformer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rules: BTreeMap<_, Vec<_>> = self
            .rules
            .iter()
            .map(|(k, v)| (*k, v.iter().map(|r| r.name.as_str()).collect()))
            .collect();
        f.debug_struct("CompoundTransformer")
            .field("deletions", &self.deletions)
            .field("rules", &rules)
            .finish()
    }
}

impl CompoundTransformer {
    pub fn builder() -> CompoundTransformerBuilder {
        CompoundTransformerBuilder::default()
    }

    pub fn is_empty(&self) -> bool {
        self.deletions.is_empty() && self.rules.is_empty()
    }

    pub fn transform(&self, raw: &MementoRawData) -> Result<MementoRawData> {
        let mut out = raw.clone();
        for kind in BrooklynObjectType::ALL {
            if let Some(ids) = self.deletions.get(&kind) {
                for id in ids {
                    let removed = out.remove(kind, id).is_some();
                    let jar = kind == BrooklynObjectType::ManagedBundle
                        && out.bundle_jars.remove(id).is_some();
                    if removed || jar {
                        debug!(kind = %kind, id = %id, "Deleted memento");
                    } else {
                        info!(kind = %kind, id = %id, "Memento requested for deletion not found; ignoring");
                    }
                }
            }
            let (Some(rules), Some(group)) = (self.rules.get(&kind), out.group_mut(kind)) else {
                continue;
            };
            for (id, content) in group.iter_mut() {
                for rule in rules {
                    *content = rule.apply(content.as_str()).map_err(|e| {
                        EngineError::Transform(format!(
                            "{} failed on {} {}: {}",
                            rule.name,
                            kind,
                            id,
                            e.user_message()
                        ))
                    })?;
                }
            }
        }
        Ok(out)
    }

    /// Loads, transforms and writes back the difference as one batch.
    /// With `dry_run` nothing is written. Returns the batch.
    pub async fn apply_to_store(&self, store: &dyn MementoStore, dry_run: bool) -> Result<MementoDelta> {
        let raw = store.load_raw_data().await?;
        let transformed = self.transform(&raw)?;
        let delta = raw.delta_to(&transformed);
        info!(
            changed = delta.writes.len(),
            deleted = delta.deletes.len() + delta.jar_deletes.len(),
            dry_run,
            "Memento transform computed"
        );
        if !dry_run && !delta.is_empty() {
            store.apply(&delta).await?;
        }
        Ok(delta)
    }
}

/// Rules added without an explicit type apply to every object type; bundle
/// archives themselves are only ever deleted, never rewritten.
#[derive(Default)]
pub struct CompoundTransformerBuilder {
    deletions: BTreeMap<BrooklynObjectType, BTreeSet<String>>,
    rules: Vec<(Vec<BrooklynObjectType>, RuleOrCustom)>,
}

enum RuleOrCustom {
    Spec(RuleSpec),
    Custom { name: String, f: ContentTransform },
}

impl CompoundTransformerBuilder {
    pub fn delete<I, S>(mut self, kind: BrooklynObjectType, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.deletions
            .entry(kind)
            .or_default()
            .extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn delete_entity(self, id: impl Into<String>) -> Self {
        self.delete(BrooklynObjectType::Entity, [id.into()])
    }

    pub fn delete_feed(self, id: impl Into<String>) -> Self {
        self.delete(BrooklynObjectType::Feed, [id.into()])
    }

    pub fn rule(mut self, spec: RuleSpec) -> Self {
        self.rules.push((BrooklynObjectType::ALL.to_vec(), RuleOrCustom::Spec(spec)));
        self
    }

    /// A rule scoped to the given types; an empty list means every type.
    pub fn rule_for(mut self, types: &[BrooklynObjectType], spec: RuleSpec) -> Self {
        let types = if types.is_empty() {
            BrooklynObjectType::ALL.to_vec()
        } else {
            types.to_vec()
        };
        self.rules.push((types, RuleOrCustom::Spec(spec)));
        self
    }

    pub fn rename_type(self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.rule(RuleSpec::RenameType {
            from: from.into(),
            to: to.into(),
        })
    }

    pub fn rename_class_tag(self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.rule(RuleSpec::RenameClassTag {
            from: from.into(),
            to: to.into(),
        })
    }

    pub fn rename_field(
        self,
        class_tag: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        self.rule(RuleSpec::RenameField {
            class_tag: class_tag.into(),
            from: from.into(),
            to: to.into(),
        })
    }

    pub fn change_catalog_item_id(
        self,
        old_symbolic_name: &str,
        old_version: &str,
        new_symbolic_name: &str,
        new_version: &str,
    ) -> Self {
        self.rule(RuleSpec::ChangeCatalogItemId {
            from: format!("{}:{}", old_symbolic_name, old_version),
            to: format!("{}:{}", new_symbolic_name, new_version),
        })
    }

    pub fn xml_replace_text(self, pattern: impl Into<String>, replacement: impl Into<String>) -> Self {
        self.rule(RuleSpec::XmlReplaceText {
            pattern: pattern.into(),
            replacement: replacement.into(),
        })
    }

    pub fn delete_element(self, name: impl Into<String>) -> Self {
        self.rule(RuleSpec::DeleteElement { name: name.into() })
    }

    pub fn custom<F>(mut self, kind: BrooklynObjectType, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&str) -> Result<String> + Send + Sync + 'static,
    {
        self.rules.push((
            vec![kind],
            RuleOrCustom::Custom {
                name: name.into(),
                f: Arc::new(f),
            },
        ));
        self
    }

    /// Compiles every pattern; an invalid one fails the whole build.
    pub fn build(self) -> Result<CompoundTransformer> {
        let mut rules: BTreeMap<BrooklynObjectType, Vec<NamedRule>> = BTreeMap::new();
        for (types, rule) in self.rules {
            for kind in types {
                let named = match &rule {
                    RuleOrCustom::Spec(spec) => NamedRule::compile(spec)?,
                    RuleOrCustom::Custom { name, f } => NamedRule {
                        name: name.clone(),
                        rule: Rule::Custom { f: f.clone() },
                    },
                };
                rules.entry(kind).or_default().push(named);
            }
        }
        Ok(CompoundTransformer {
            deletions: self.deletions,
            rules,
        })
    }
}
