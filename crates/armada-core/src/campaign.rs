use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

use crate::model::{ChangesetTemplate, Step};

/// A campaign document as written by the user. Repository resolution and
/// upload of the produced specs happen in the control plane; the engine only
/// needs the parsed form.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CampaignSpec {
    pub name: String,
    pub description: String,
    pub on: Vec<OnQueryOrRepository>,
    pub steps: Vec<Step>,
    pub changeset_template: Option<ChangesetTemplate>,
    pub import_changesets: Vec<ImportChangeset>,
}

impl CampaignSpec {
    pub fn parse(input: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(input)
    }

    /// Check the document for structural problems, reporting every violation
    /// rather than stopping at the first.
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = Vec::new();

        if self.on.is_empty() && self.import_changesets.is_empty() {
            errors.push(ValidationError::NothingToDo);
        }

        for (i, on) in self.on.iter().enumerate() {
            match (
                on.repositories_matching_query.is_empty(),
                on.repository.is_empty(),
            ) {
                (true, true) => errors.push(ValidationError::MalformedOn { index: i }),
                (false, false) => errors.push(ValidationError::AmbiguousOn { index: i }),
                _ => {}
            }
        }

        if !self.on.is_empty() && self.steps.is_empty() {
            errors.push(ValidationError::NoSteps);
        }

        for (i, step) in self.steps.iter().enumerate() {
            if step.container.is_empty() {
                errors.push(ValidationError::StepMissingContainer { index: i });
            }
            if step.run.is_empty() {
                errors.push(ValidationError::StepMissingRun { index: i });
            }
        }

        if !self.steps.is_empty() {
            match &self.changeset_template {
                None => errors.push(ValidationError::MissingChangesetTemplate),
                Some(t) => {
                    if t.branch.is_empty() {
                        errors.push(ValidationError::TemplateMissingField { field: "branch" });
                    }
                    if t.title.is_empty() {
                        errors.push(ValidationError::TemplateMissingField { field: "title" });
                    }
                    if t.commit.message.is_empty() {
                        errors.push(ValidationError::TemplateMissingField {
                            field: "commit.message",
                        });
                    }
                }
            }
        }

        for (i, ic) in self.import_changesets.iter().enumerate() {
            if ic.repository.is_empty() {
                errors.push(ValidationError::ImportMissingRepository { index: i });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationErrors(errors))
        }
    }
}

/// One entry of the `on:` list. Exactly one of the two fields is set in a
/// valid document.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OnQueryOrRepository {
    pub repositories_matching_query: String,
    pub repository: String,
}

impl OnQueryOrRepository {
    pub fn label(&self) -> &str {
        if !self.repositories_matching_query.is_empty() {
            &self.repositories_matching_query
        } else {
            &self.repository
        }
    }
}

/// Changesets that already exist on the code host and should be attached to
/// the campaign instead of computed.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImportChangeset {
    pub repository: String,
    #[serde(rename = "externalIDs")]
    pub external_ids: Vec<ExternalId>,
}

/// External changeset id. Documents may write these as strings or numbers;
/// they are normalized to strings at parse time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExternalId(pub String);

impl std::fmt::Display for ExternalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for ExternalId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ExternalId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct IdVisitor;

        impl Visitor<'_> for IdVisitor {
            type Value = ExternalId;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a string or integer changeset id")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                Ok(ExternalId(v.to_string()))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                Ok(ExternalId(v.to_string()))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(ExternalId(v.to_string()))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
                Ok(ExternalId(v.to_string()))
            }
        }

        deserializer.deserialize_any(IdVisitor)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("campaign has neither an on: clause nor importChangesets")]
    NothingToDo,
    #[error("malformed on field at index {index}: missing either a repository name or a query")]
    MalformedOn { index: usize },
    #[error("malformed on field at index {index}: both a repository name and a query given")]
    AmbiguousOn { index: usize },
    #[error("an on: clause is given but the campaign has no steps")]
    NoSteps,
    #[error("step {index} has no container image")]
    StepMissingContainer { index: usize },
    #[error("step {index} has no run command")]
    StepMissingRun { index: usize },
    #[error("campaign with steps has no changesetTemplate")]
    MissingChangesetTemplate,
    #[error("changesetTemplate is missing {field}")]
    TemplateMissingField { field: &'static str },
    #[error("importChangesets entry {index} has no repository")]
    ImportMissingRepository { index: usize },
}

/// All violations found in one validation pass.
#[derive(Debug)]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "campaign spec failed validation:")?;
        for (i, e) in self.0.iter().enumerate() {
            writeln!(f, "  {}. {e}", i + 1)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}
