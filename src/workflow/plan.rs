//! Plan and generated-code records carried between phases.
//!
//! These are the only shapes that cross the planning/implementation boundary:
//! conversational context never does.

use serde::{Deserialize, Serialize};

/// Coarse difficulty estimate attached to a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

/// One file the plan intends to touch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedFile {
    pub path: String,
    pub purpose: String,
}

/// A file read during planning, carried into implementation so the
/// generation prompt can include real content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExploredFile {
    pub path: String,
    pub content: String,
    /// Planner-assigned relevance, highest first when included in prompts.
    #[serde(default)]
    pub relevance: u32,
}

/// The product of the planning phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImplementationPlan {
    pub summary: String,
    pub approach: String,
    pub files: Vec<PlannedFile>,
    pub complexity: Complexity,
    #[serde(default)]
    pub caveats: Vec<String>,
    /// Raw planning response, kept for diagnostics only.
    #[serde(default)]
    pub raw_response: Option<String>,
}

impl ImplementationPlan {
    pub fn planned_paths(&self) -> Vec<&str> {
        self.files.iter().map(|f| f.path.as_str()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileAction {
    Create,
    Modify,
    Delete,
}

/// One generated file change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedFile {
    pub path: String,
    #[serde(default)]
    pub content: String,
    pub action: FileAction,
}

/// The product of the implementation phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedCode {
    pub files: Vec<GeneratedFile>,
    pub commit_message: String,
    pub pr_title: String,
    #[serde(default)]
    pub pr_description: String,
}

impl GeneratedCode {
    /// Drops generated files that were never planned (logged as warnings)
    /// and logs planned files the generation skipped. Neither is fatal.
    pub fn filter_to_plan(&mut self, plan: &ImplementationPlan) {
        let planned: Vec<&str> = plan.planned_paths();

        self.files.retain(|file| {
            let keep = planned.contains(&file.path.as_str());
            if !keep {
                tracing::warn!(path = %file.path, "dropping generated file not present in plan");
            }
            keep
        });

        for planned_file in &plan.files {
            if !self.files.iter().any(|f| f.path == planned_file.path) {
                tracing::info!(
                    path = %planned_file.path,
                    "planned file missing from generated output"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan_with(paths: &[&str]) -> ImplementationPlan {
        ImplementationPlan {
            summary: "s".to_string(),
            approach: "a".to_string(),
            files: paths
                .iter()
                .map(|p| PlannedFile {
                    path: p.to_string(),
                    purpose: "p".to_string(),
                })
                .collect(),
            complexity: Complexity::Low,
            caveats: Vec::new(),
            raw_response: None,
        }
    }

    fn generated(paths: &[&str]) -> GeneratedCode {
        GeneratedCode {
            files: paths
                .iter()
                .map(|p| GeneratedFile {
                    path: p.to_string(),
                    content: "x".to_string(),
                    action: FileAction::Modify,
                })
                .collect(),
            commit_message: "m".to_string(),
            pr_title: "t".to_string(),
            pr_description: String::new(),
        }
    }

    #[test]
    fn unplanned_files_are_dropped() {
        let plan = plan_with(&["src/a.ts", "src/b.ts"]);
        let mut code = generated(&["src/a.ts", "src/rogue.ts"]);
        code.filter_to_plan(&plan);
        assert_eq!(code.files.len(), 1);
        assert_eq!(code.files[0].path, "src/a.ts");
    }

    #[test]
    fn missing_planned_files_are_not_fatal() {
        let plan = plan_with(&["src/a.ts", "src/b.ts"]);
        let mut code = generated(&["src/a.ts"]);
        code.filter_to_plan(&plan);
        assert_eq!(code.files.len(), 1);
    }

    #[test]
    fn generated_code_round_trips_camel_case() {
        let json = r#"{
            "files": [{"path": "src/a.ts", "content": "x", "action": "create"}],
            "commitMessage": "add a",
            "prTitle": "Add a",
            "prDescription": "adds a"
        }"#;
        let code: GeneratedCode = serde_json::from_str(json).unwrap();
        assert_eq!(code.commit_message, "add a");
        assert_eq!(code.files[0].action, FileAction::Create);
    }
}
