//! Agent registry built from a tree of markdown agent descriptors.
//!
//! One `.md` file describes one agent. Metadata extraction sits behind
//! [`DescriptorExtractor`]; the default [`HeuristicExtractor`] honours explicit
//! `role:` / `tier:` declarations first and falls back to path and content keywords.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::protocol::{AgentRole, Tier};

/// A registered agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentInfo {
    pub name: String,
    pub role: AgentRole,
    pub tier: Tier,
    /// First directory under the registry root, if any
    pub department: Option<String>,
    pub path: PathBuf,
}

/// Metadata recovered from one descriptor document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub name: String,
    pub role: AgentRole,
    pub tier: Tier,
}

/// Turns a descriptor document into agent metadata.
pub trait DescriptorExtractor: Send + Sync {
    /// `relative` is the document path under the registry root.
    /// Returning `None` skips the document.
    fn extract(&self, relative: &Path, content: &str) -> Option<Descriptor>;
}

const TITLE_PATTERN: &str = r"(?m)^#\s+(.+)$";
const ROLE_PATTERN: &str =
    r"(?im)^\s*(?:[-*]\s*)?(?:\*\*)?role(?:\*\*)?:\s*(coordinator|specialist|orchestrator)\b";
const MODEL_PATTERN: &str = r"(?i)\*\*model\*\*:\s*(opus|sonnet|haiku)";
const TIER_PATTERN: &str = r"(?i)tier:\s*(opus|sonnet|haiku)";

static TITLE: OnceLock<Option<Regex>> = OnceLock::new();
static ROLE_DECL: OnceLock<Option<Regex>> = OnceLock::new();
static MODEL_DECL: OnceLock<Option<Regex>> = OnceLock::new();
static TIER_DECL: OnceLock<Option<Regex>> = OnceLock::new();

fn compiled(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

fn captures<'c>(
    cell: &'static OnceLock<Option<Regex>>,
    pattern: &str,
    content: &'c str,
) -> Option<regex::Captures<'c>> {
    compiled(cell, pattern)?.captures(content)
}

/// Keyword-based extraction for free-form agent descriptions.
///
/// Name: the first `# Title`, lowercased with anything outside `[a-z0-9-]`
/// replaced by `-`; otherwise the file stem.
/// Role: an explicit `role:` line; otherwise path keywords, then content keywords;
/// default specialist.
/// Tier: `tier:` over `**model**:`; default sonnet.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicExtractor;

impl HeuristicExtractor {
    fn name(relative: &Path, content: &str) -> Option<String> {
        if let Some(caps) = captures(&TITLE, TITLE_PATTERN, content) {
            let title = caps[1].trim().to_lowercase();
            let slug: String = title
                .chars()
                .map(|c| {
                    if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
                        c
                    } else {
                        '-'
                    }
                })
                .collect();
            if !slug.is_empty() {
                return Some(slug);
            }
        }
        relative
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
    }

    fn role(relative: &Path, content: &str) -> AgentRole {
        if let Some(caps) = captures(&ROLE_DECL, ROLE_PATTERN, content) {
            if let Ok(role) = caps[1].to_lowercase().parse() {
                return role;
            }
        }

        let mut role = AgentRole::Specialist;
        let path = relative.to_string_lossy().to_lowercase();
        if path.contains("coordinator") {
            role = AgentRole::Coordinator;
        } else if path.contains("orchestrat") {
            role = AgentRole::Orchestrator;
        }

        let lower = content.to_lowercase();
        if lower.contains("coordinator") && !lower.contains("specialist") {
            role = AgentRole::Coordinator;
        } else if lower.contains("orchestrator") {
            role = AgentRole::Orchestrator;
        }
        role
    }

    fn tier(content: &str) -> Tier {
        captures(&TIER_DECL, TIER_PATTERN, content)
            .or_else(|| captures(&MODEL_DECL, MODEL_PATTERN, content))
            .and_then(|caps| caps[1].to_lowercase().parse().ok())
            .unwrap_or(Tier::Sonnet)
    }
}

impl DescriptorExtractor for HeuristicExtractor {
    fn extract(&self, relative: &Path, content: &str) -> Option<Descriptor> {
        Some(Descriptor {
            name: Self::name(relative, content)?,
            role: Self::role(relative, content),
            tier: Self::tier(content),
        })
    }
}

/// Agent counts by role, tier and department.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub by_role: BTreeMap<String, usize>,
    pub by_tier: BTreeMap<String, usize>,
    pub by_department: BTreeMap<String, usize>,
}

/// In-memory agent directory. [`AgentRegistry::refresh`] is the only mutation.
pub struct AgentRegistry {
    root: PathBuf,
    agents: HashMap<String, AgentInfo>,
    skipped: Vec<PathBuf>,
    extractor: Box<dyn DescriptorExtractor>,
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("root", &self.root)
            .field("agents", &self.agents.len())
            .field("skipped", &self.skipped)
            .finish()
    }
}

impl AgentRegistry {
    /// Scan `root` with the heuristic extractor.
    pub fn load(root: impl Into<PathBuf>) -> Result<Self> {
        Self::with_extractor(root, Box::new(HeuristicExtractor))
    }

    pub fn with_extractor(
        root: impl Into<PathBuf>,
        extractor: Box<dyn DescriptorExtractor>,
    ) -> Result<Self> {
        let mut registry = Self {
            root: root.into(),
            agents: HashMap::new(),
            skipped: Vec::new(),
            extractor,
        };
        registry.refresh()?;
        Ok(registry)
    }

    /// Registry with no agents and no backing directory.
    pub fn empty() -> Self {
        Self {
            root: PathBuf::new(),
            agents: HashMap::new(),
            skipped: Vec::new(),
            extractor: Box::new(HeuristicExtractor),
        }
    }

    /// Clear and rebuild from the root directory.
    ///
    /// A missing root yields an empty registry. Unreadable documents are
    /// recorded in [`AgentRegistry::skipped`].
    pub fn refresh(&mut self) -> Result<()> {
        self.agents.clear();
        self.skipped.clear();

        if !self.root.is_dir() {
            return Ok(());
        }

        let pattern = format!(
            "{}/**/*.md",
            glob::Pattern::escape(&self.root.to_string_lossy())
        );
        let entries = glob::glob(&pattern)
            .map_err(|e| Error::Registry(format!("invalid descriptor pattern {}: {}", pattern, e)))?;

        for entry in entries {
            let path = match entry {
                Ok(path) => path,
                Err(e) => {
                    self.skipped.push(e.path().to_path_buf());
                    continue;
                }
            };
            if !path.is_file() {
                continue;
            }
            let content = match fs::read_to_string(&path) {
                Ok(content) => content,
                Err(_) => {
                    self.skipped.push(path);
                    continue;
                }
            };

            let relative = path.strip_prefix(&self.root).unwrap_or(&path).to_path_buf();
            let Some(descriptor) = self.extractor.extract(&relative, &content) else {
                self.skipped.push(path);
                continue;
            };

            let department = department_of(&relative);
            self.agents.insert(
                descriptor.name.clone(),
                AgentInfo {
                    name: descriptor.name,
                    role: descriptor.role,
                    tier: descriptor.tier,
                    department,
                    path,
                },
            );
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn find_by_name(&self, name: &str) -> Option<&AgentInfo> {
        self.agents.get(name)
    }

    pub fn find_by_role(&self, role: AgentRole) -> Vec<&AgentInfo> {
        self.filtered(|a| a.role == role)
    }

    pub fn find_by_tier(&self, tier: Tier) -> Vec<&AgentInfo> {
        self.filtered(|a| a.tier == tier)
    }

    pub fn find_by_department(&self, department: &str) -> Vec<&AgentInfo> {
        self.filtered(|a| a.department.as_deref() == Some(department))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    /// All agents, sorted by name.
    pub fn all(&self) -> Vec<&AgentInfo> {
        self.filtered(|_| true)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Descriptor files that could not be read or yielded no agent.
    pub fn skipped(&self) -> &[PathBuf] {
        &self.skipped
    }

    /// Hard routing policy. Unknown agents never route.
    pub fn can_route(&self, sender: &str, recipient: &str) -> bool {
        let (Some(sender), Some(recipient)) = (self.agents.get(sender), self.agents.get(recipient))
        else {
            return false;
        };
        role_allows(sender.role, recipient.role)
    }

    pub fn stats(&self) -> RegistryStats {
        let mut by_role: BTreeMap<String, usize> =
            AgentRole::WIRE.iter().map(|r| (r.to_string(), 0)).collect();
        let mut by_tier: BTreeMap<String, usize> =
            Tier::WIRE.iter().map(|t| (t.to_string(), 0)).collect();
        let mut by_department = BTreeMap::new();

        for agent in self.agents.values() {
            *by_role.entry(agent.role.to_string()).or_insert(0) += 1;
            *by_tier.entry(agent.tier.to_string()).or_insert(0) += 1;
            if let Some(department) = &agent.department {
                *by_department.entry(department.clone()).or_insert(0) += 1;
            }
        }

        RegistryStats {
            total: self.agents.len(),
            by_role,
            by_tier,
            by_department,
        }
    }

    fn filtered(&self, keep: impl Fn(&AgentInfo) -> bool) -> Vec<&AgentInfo> {
        let mut agents: Vec<&AgentInfo> = self.agents.values().filter(|a| keep(a)).collect();
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        agents
    }
}

/// Role pairs the registry lets through.
pub fn role_allows(sender: AgentRole, recipient: AgentRole) -> bool {
    match sender {
        AgentRole::Coordinator => {
            matches!(recipient, AgentRole::Specialist | AgentRole::Coordinator)
        }
        AgentRole::Specialist => {
            matches!(recipient, AgentRole::Coordinator | AgentRole::Orchestrator)
        }
        AgentRole::Orchestrator => recipient == AgentRole::Coordinator,
    }
}

fn department_of(relative: &Path) -> Option<String> {
    let mut components = relative.components();
    let first = components.next()?;
    // a file directly under the root has no department
    components.next()?;
    Some(first.as_os_str().to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(root: &Path, relative: &str, content: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn fixture() -> TempDir {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write(
            root,
            "engineering/engineering-coordinator.md",
            "# Engineering Coordinator\n\nCoordinates the engineering team.\n**Model**: opus\n",
        );
        write(
            root,
            "engineering/api-specialist.md",
            "# API Specialist\n\nSpecialist in REST design.\n**model**: sonnet\n",
        );
        write(
            root,
            "engineering/db-specialist.md",
            "# DB Specialist\n\nSpecialist for schemas.\ntier: haiku\n",
        );
        write(
            root,
            "leadership/cto.md",
            "# CTO\n\nThe orchestrator of all departments.\ntier: opus\n",
        );
        write(root, "loose-agent.md", "No title here.\n");
        dir
    }

    #[test]
    fn test_load_extracts_metadata() {
        let dir = fixture();
        let registry = AgentRegistry::load(dir.path()).unwrap();
        assert_eq!(registry.len(), 5);

        let coord = registry.find_by_name("engineering-coordinator").unwrap();
        assert_eq!(coord.role, AgentRole::Coordinator);
        assert_eq!(coord.tier, Tier::Opus);
        assert_eq!(coord.department.as_deref(), Some("engineering"));

        let db = registry.find_by_name("db-specialist").unwrap();
        assert_eq!(db.role, AgentRole::Specialist);
        assert_eq!(db.tier, Tier::Haiku);

        let cto = registry.find_by_name("cto").unwrap();
        assert_eq!(cto.role, AgentRole::Orchestrator);

        let loose = registry.find_by_name("loose-agent").unwrap();
        assert_eq!(loose.role, AgentRole::Specialist);
        assert_eq!(loose.tier, Tier::Sonnet);
        assert_eq!(loose.department, None);
    }

    #[test]
    fn test_descriptor_patterns_compile() {
        assert!(compiled(&TITLE, TITLE_PATTERN).is_some());
        assert!(compiled(&ROLE_DECL, ROLE_PATTERN).is_some());
        assert!(compiled(&MODEL_DECL, MODEL_PATTERN).is_some());
        assert!(compiled(&TIER_DECL, TIER_PATTERN).is_some());
    }

    #[test]
    fn test_explicit_declarations_win() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "ops/coordinator-helpers/runner.md",
            "# Runner\n\nrole: specialist\n**model**: opus\ntier: haiku\n",
        );
        let registry = AgentRegistry::load(dir.path()).unwrap();
        let runner = registry.find_by_name("runner").unwrap();
        assert_eq!(runner.role, AgentRole::Specialist);
        assert_eq!(runner.tier, Tier::Haiku);
    }

    #[test]
    fn test_title_slug() {
        let name = HeuristicExtractor::name(Path::new("x.md"), "# Data & ML Lead\n");
        assert_eq!(name.as_deref(), Some("data---ml-lead"));
    }

    #[test]
    fn test_roles_partition_registry() {
        let dir = fixture();
        let registry = AgentRegistry::load(dir.path()).unwrap();
        let mut names: Vec<&str> = AgentRole::ALL
            .iter()
            .flat_map(|role| registry.find_by_role(*role))
            .map(|a| a.name.as_str())
            .collect();
        names.sort();
        let all: Vec<&str> = registry.all().iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, all);
    }

    #[test]
    fn test_can_route() {
        let dir = fixture();
        let registry = AgentRegistry::load(dir.path()).unwrap();
        assert!(registry.can_route("engineering-coordinator", "api-specialist"));
        assert!(registry.can_route("api-specialist", "engineering-coordinator"));
        assert!(registry.can_route("api-specialist", "cto"));
        assert!(registry.can_route("cto", "engineering-coordinator"));
        assert!(!registry.can_route("engineering-coordinator", "cto"));
        assert!(!registry.can_route("api-specialist", "db-specialist"));
        assert!(!registry.can_route("cto", "api-specialist"));
        assert!(!registry.can_route("ghost", "cto"));
        assert!(!registry.can_route("cto", "ghost"));
    }

    #[test]
    fn test_stats_and_lookups() {
        let dir = fixture();
        let registry = AgentRegistry::load(dir.path()).unwrap();
        let stats = registry.stats();
        assert_eq!(stats.total, 5);
        assert_eq!(stats.by_role["specialist"], 3);
        assert_eq!(stats.by_role["orchestrator"], 1);
        assert_eq!(stats.by_tier["opus"], 2);
        assert_eq!(stats.by_department["engineering"], 3);
        assert_eq!(registry.find_by_department("leadership").len(), 1);
        assert_eq!(registry.find_by_tier(Tier::Haiku).len(), 1);
        assert!(registry.exists("cto"));
    }

    #[test]
    fn test_refresh_rebuilds() {
        let dir = fixture();
        let mut registry = AgentRegistry::load(dir.path()).unwrap();
        fs::remove_file(dir.path().join("leadership/cto.md")).unwrap();
        write(dir.path(), "qa/qa-specialist.md", "# QA Specialist\n");
        registry.refresh().unwrap();
        assert!(!registry.exists("cto"));
        assert!(registry.exists("qa-specialist"));
        assert_eq!(registry.len(), 5);
    }

    #[test]
    fn test_missing_root_is_empty() {
        let dir = TempDir::new().unwrap();
        let registry = AgentRegistry::load(dir.path().join("nope")).unwrap();
        assert!(registry.is_empty());
        assert!(!registry.can_route("a", "b"));
    }

    struct Strict;

    impl DescriptorExtractor for Strict {
        fn extract(&self, _relative: &Path, content: &str) -> Option<Descriptor> {
            let line = content.lines().find(|l| l.starts_with("agent="))?;
            Some(Descriptor {
                name: line.trim_start_matches("agent=").to_string(),
                role: AgentRole::Coordinator,
                tier: Tier::Opus,
            })
        }
    }

    #[test]
    fn test_custom_extractor() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a.md", "agent=alpha\n");
        write(dir.path(), "b.md", "free text\n");
        let registry = AgentRegistry::with_extractor(dir.path(), Box::new(Strict)).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.find_by_name("alpha").unwrap().role, AgentRole::Coordinator);
        assert_eq!(registry.skipped().len(), 1);
    }
}
