pub mod ai;
pub mod scripted;

use crate::build::spec::BuildType;
use crate::build::step::BuildStep;

use std::sync::Arc;

/// Resolves the step DAG for a build type. AI builds are a single role
/// runner; everything else goes through the staged script pipeline.
pub fn resolve(build_type: BuildType) -> Vec<Arc<dyn BuildStep>> {
    match build_type {
        BuildType::AI => vec![Arc::new(ai::AIStep)],
        ty => vec![
            Arc::new(scripted::PullBaseImages::new(ty)),
            Arc::new(scripted::IntermediateStep::new(ty)),
            Arc::new(scripted::CompileStep::new(ty)),
            Arc::new(scripted::TestStep::new(ty)),
            Arc::new(scripted::LintStep::new(ty)),
            Arc::new(scripted::ScanStep::new(ty)),
            Arc::new(scripted::PackagePushStep::new(ty)),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ai_resolves_to_a_single_step() {
        let steps = resolve(BuildType::AI);
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].name(), "ai-role");
    }

    #[test]
    fn scripted_types_share_the_staged_dag() {
        for ty in [BuildType::GoLang, BuildType::Rust, BuildType::Generic] {
            let steps = resolve(ty);
            let names: Vec<&str> = steps.iter().map(|s| s.name()).collect();
            assert_eq!(
                names,
                vec![
                    "pull-base-images",
                    "intermediate-image",
                    "compile",
                    "test",
                    "lint",
                    "scan",
                    "package-push"
                ]
            );
            assert!(steps.iter().all(|s| s.build_type() == ty));
        }
    }
}
