use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A repository resolved by the control plane. Immutable once resolved: the
/// engine pins every execution to `rev`, not to whatever the branch moves to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub id: String,
    pub name: String,
    pub default_branch: String,
    /// Commit id the default branch pointed at when the repository was
    /// resolved.
    pub rev: String,
}

impl Repository {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        default_branch: impl Into<String>,
        rev: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            default_branch: default_branch.into(),
            rev: rev.into(),
        }
    }

    /// Directory-safe form of the repository name, used in scratch-file
    /// prefixes.
    pub fn slug(&self) -> String {
        self.name.replace('/', "-")
    }
}

/// One containerized command invocation against the workspace.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// Image reference as written in the campaign document.
    pub container: String,
    /// Command string handed to the container as a single argument.
    pub run: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Content-addressed digest resolved against the registry before the
    /// campaign runs. Never read from documents; the resolver fills it in.
    #[serde(skip)]
    pub resolved_image: String,
}

impl Step {
    pub fn new(container: impl Into<String>, run: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            run: run.into(),
            env: BTreeMap::new(),
            resolved_image: String::new(),
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Record the digest the image reference resolved to.
    pub fn resolve(mut self, digest: impl Into<String>) -> Self {
        self.resolved_image = digest.into();
        self
    }

    /// Image identity to execute: the resolved digest when present, otherwise
    /// the reference as written.
    pub fn image(&self) -> &str {
        if self.resolved_image.is_empty() {
            &self.container
        } else {
            &self.resolved_image
        }
    }
}

/// Tri-state publication flag: an unset field in the document is distinct
/// from an explicit `false`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Published {
    True,
    False,
    #[default]
    Unspecified,
}

impl Published {
    pub fn as_option(self) -> Option<bool> {
        match self {
            Published::True => Some(true),
            Published::False => Some(false),
            Published::Unspecified => None,
        }
    }
}

impl From<Option<bool>> for Published {
    fn from(v: Option<bool>) -> Self {
        match v {
            Some(true) => Published::True,
            Some(false) => Published::False,
            None => Published::Unspecified,
        }
    }
}

impl Serialize for Published {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.as_option() {
            Some(b) => serializer.serialize_bool(b),
            None => serializer.serialize_none(),
        }
    }
}

impl<'de> Deserialize<'de> for Published {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Option::<bool>::deserialize(deserializer).map(Published::from)
    }
}

/// Commit metadata applied to the change each task produces.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitTemplate {
    pub message: String,
}

/// How the produced changesets should look: branch, PR title/body, commit
/// message, publication flag.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesetTemplate {
    pub branch: String,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub commit: CommitTemplate,
    #[serde(default)]
    pub published: Published,
}

/// The unit of scheduling, caching, and logging: one repository driven
/// through one step sequence toward one changeset template.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Task {
    pub repository: Repository,
    pub steps: Vec<Step>,
    pub template: ChangesetTemplate,
}

impl Task {
    pub fn new(repository: Repository, steps: Vec<Step>, template: ChangesetTemplate) -> Self {
        Self {
            repository,
            steps,
            template,
        }
    }
}

/// The artifact one task produces: a proposed change on a branch of one
/// repository, or a reference to a changeset that already exists on the code
/// host.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChangesetSpec {
    Created(CreatedChangeset),
    External(ExternalChangeset),
}

impl ChangesetSpec {
    /// Spec for a changeset imported from the code host rather than computed
    /// by the engine.
    pub fn external(base_repository: impl Into<String>, external_id: impl Into<String>) -> Self {
        ChangesetSpec::External(ExternalChangeset {
            base_repository: base_repository.into(),
            external_id: external_id.into(),
        })
    }

    pub fn base_repository(&self) -> &str {
        match self {
            ChangesetSpec::Created(c) => &c.base_repository,
            ChangesetSpec::External(e) => &e.base_repository,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedChangeset {
    pub base_repository: String,
    pub base_ref: String,
    pub base_rev: String,
    pub head_repository: String,
    pub head_ref: String,
    pub title: String,
    pub body: String,
    pub commits: Vec<GitCommitDescription>,
    pub published: Published,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalChangeset {
    pub base_repository: String,
    #[serde(rename = "externalID")]
    pub external_id: String,
}

/// One commit of the produced change: message plus the unified diff payload
/// (no path prefixes, binary hunks inlined).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitCommitDescription {
    pub message: String,
    pub diff: String,
}
