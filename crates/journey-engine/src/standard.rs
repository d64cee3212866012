//! The compiled-in production catalog: 22 steps across six phases, plus the
//! guards that gate its sensitive transitions.

use std::time::Duration;

use journey_types::{EngineError, Result};

use crate::catalog::{Phase, RulePredicate, StepCatalog, StepDefinition};
use crate::guards::{GuardTable, NavigationGuardRule};

fn minutes(n: u64) -> Duration {
    Duration::from_secs(n * 60)
}

fn url_pattern() -> Result<RulePredicate> {
    RulePredicate::pattern(r"^https?://\S+$").map_err(|e| EngineError::InvalidRule {
        step: "video_review".into(),
        path: "video.url".into(),
        message: e.to_string(),
    })
}

fn standard_steps() -> Result<Vec<StepDefinition>> {
    use Phase::*;

    Ok(vec![
        // --- Authentication ---
        StepDefinition::new("auth_login", Authentication)
            .title("Sign in")
            .requires(&["auth.user_id", "auth.token"])
            .duration(minutes(1))
            .weight(1),
        StepDefinition::new("auth_profile", Authentication)
            .title("Complete profile")
            .depends_on(&["auth_login"])
            .requires(&["auth.display_name"])
            .optional(&["auth.avatar_url"])
            .skippable(&["returning_user"])
            .duration(minutes(2))
            .weight(1),
        // --- Scenario ---
        StepDefinition::new("scenario_intent", Scenario)
            .title("Describe the idea")
            .depends_on(&["auth_login"])
            .requires(&["scenario.genre", "scenario.intent"])
            .optional(&["scenario.audience"])
            .rule(
                "scenario.genre",
                RulePredicate::one_of(&[
                    "drama",
                    "comedy",
                    "documentary",
                    "commercial",
                    "music_video",
                ]),
                "Pick one of the supported genres",
            )
            .rule(
                "scenario.intent",
                RulePredicate::MinLength(10),
                "Describe the idea in at least 10 characters",
            )
            .duration(minutes(3))
            .weight(2),
        StepDefinition::new("scenario_structure", Scenario)
            .title("Choose a structure")
            .depends_on(&["scenario_intent"])
            .requires(&["scenario.structure"])
            .rule("scenario.structure", RulePredicate::MinItems(4), "A structure needs four acts")
            .duration(minutes(3))
            .weight(2),
        StepDefinition::new("scenario_draft", Scenario)
            .title("Draft the scenario")
            .depends_on(&["scenario_structure"])
            .requires(&["scenario.draft"])
            .rule("scenario.draft", RulePredicate::MinLength(50), "The draft is too short")
            .duration(minutes(10))
            .weight(4),
        StepDefinition::new("scenario_review", Scenario)
            .title("Review the scenario")
            .depends_on(&["scenario_draft"])
            .requires(&["scenario.approved"])
            .skippable(&["auto_approve"])
            .duration(minutes(2))
            .weight(1),
        StepDefinition::new("story_outline", Scenario)
            .title("Outline the story")
            .depends_on(&["scenario_draft"])
            .requires(&["scenario.outline"])
            .duration(minutes(5))
            .weight(3),
        StepDefinition::new("story_characters", Scenario)
            .title("Define characters")
            .depends_on(&["story_outline"])
            .requires(&["scenario.characters"])
            .skippable(&["single_character"])
            .duration(minutes(4))
            .weight(2),
        // --- Planning ---
        StepDefinition::new("planning_shots", Planning)
            .title("Break down shots")
            .depends_on(&["story_outline"])
            .requires(&["planning.shots"])
            .rule("planning.shots", RulePredicate::MinItems(12), "Twelve shots are required")
            .duration(minutes(8))
            .weight(5),
        StepDefinition::new("planning_storyboard", Planning)
            .title("Build the storyboard")
            .depends_on(&["planning_shots"])
            .requires(&["planning.storyboard"])
            .duration(minutes(10))
            .weight(4),
        StepDefinition::new("planning_contis", Planning)
            .title("Generate continuity sheets")
            .depends_on(&["planning_storyboard"])
            .requires(&["planning.contis"])
            .skippable(&["storyboard_only"])
            .duration(minutes(6))
            .weight(3),
        StepDefinition::new("planning_schedule", Planning)
            .title("Schedule the shoot")
            .depends_on(&["planning_shots"])
            .requires(&["planning.schedule"])
            .skippable(&["no_live_shoot"])
            .duration(minutes(3))
            .weight(1),
        StepDefinition::new("planning_review", Planning)
            .title("Lock the plan")
            .depends_on(&["planning_storyboard"])
            .requires(&["planning.locked"])
            .duration(minutes(2))
            .weight(1),
        // --- Video ---
        StepDefinition::new("video_prompt", Video)
            .title("Write the video prompt")
            .depends_on(&["planning_review"])
            .requires(&["video.prompt"])
            .rule(
                "video.prompt",
                RulePredicate::MaxLength(2000),
                "Prompts are limited to 2000 characters",
            )
            .duration(minutes(3))
            .weight(2),
        StepDefinition::new("video_settings", Video)
            .title("Choose output settings")
            .depends_on(&["video_prompt"])
            .requires(&["video.resolution", "video.duration_secs"])
            .optional(&["video.style"])
            .rule(
                "video.resolution",
                RulePredicate::one_of(&["720p", "1080p", "4k"]),
                "Unsupported resolution",
            )
            .rule(
                "video.duration_secs",
                RulePredicate::Range { min: 1.0, max: 120.0 },
                "Videos must be between 1 and 120 seconds",
            )
            .duration(minutes(1))
            .weight(1),
        StepDefinition::new("video_generate", Video)
            .title("Generate the video")
            .depends_on(&["video_settings"])
            .requires(&["video.job_id"])
            .duration(minutes(15))
            .weight(8),
        StepDefinition::new("video_review", Video)
            .title("Review the video")
            .depends_on(&["video_generate"])
            .requires(&["video.url"])
            .rule("video.url", url_pattern()?, "The video link is not a valid URL")
            .duration(minutes(3))
            .weight(2),
        // --- Feedback ---
        StepDefinition::new("feedback_share", Feedback)
            .title("Share for feedback")
            .depends_on(&["video_review"])
            .requires(&["feedback.recipients"])
            .rule("feedback.recipients", RulePredicate::MinItems(1), "Add at least one recipient")
            .skippable(&["private_project"])
            .duration(minutes(2))
            .weight(1),
        StepDefinition::new("feedback_collect", Feedback)
            .title("Collect feedback")
            .depends_on(&["video_review"])
            .requires(&["feedback.comments"])
            .skippable(&["no_reviewers"])
            .duration(minutes(10))
            .weight(2),
        StepDefinition::new("feedback_revise", Feedback)
            .title("Apply revisions")
            .depends_on(&["video_review"])
            .optional(&["feedback.revision_notes"])
            .skippable(&["no_changes"])
            .duration(minutes(8))
            .weight(3),
        // --- Completion ---
        StepDefinition::new("project_export", Completion)
            .title("Export the project")
            .depends_on(&["video_review"])
            .requires(&["project.export_format"])
            .rule(
                "project.export_format",
                RulePredicate::one_of(&["mp4", "mov", "webm"]),
                "Unsupported export format",
            )
            .duration(minutes(2))
            .weight(2),
        StepDefinition::new("project_complete", Completion)
            .title("Finish")
            .depends_on(&["project_export"])
            .requires(&["project.export_url"])
            .duration(minutes(1))
            .weight(1),
    ])
}

impl StepCatalog {
    /// The standard production catalog.
    pub fn standard() -> Result<Self> {
        StepCatalog::new(standard_steps()?)
    }
}

/// Guards for [`StepCatalog::standard`].
pub fn standard_guards(catalog: &StepCatalog) -> Result<GuardTable> {
    let rules = vec![
        NavigationGuardRule::new(
            "session_authenticated",
            "auth_login",
            "scenario_intent",
            "auth.token && auth.expired!=true",
            "Sign in again before starting a scenario",
        )?
        .with_redirect("auth_login"),
        NavigationGuardRule::new(
            "draft_saved",
            "scenario_draft",
            "scenario_review",
            "scenario.draft_saved=true",
            "Save the draft before sending it for review",
        )?,
        NavigationGuardRule::new(
            "plan_locked",
            "planning_review",
            "video_prompt",
            "planning.locked=true",
            "Lock the storyboard before writing the video prompt",
        )?
        .with_redirect("planning_storyboard"),
        NavigationGuardRule::new(
            "generation_finished",
            "video_generate",
            "video_review",
            "video.status=completed",
            "Video generation has not finished",
        )?
        .with_redirect("video_generate"),
        NavigationGuardRule::new(
            "video_approved",
            "video_review",
            "feedback_share",
            "video.approved=true",
            "Approve the video before sharing it",
        )?
        .allowing_skip_override(),
        NavigationGuardRule::new(
            "revisions_applied",
            "feedback_revise",
            "project_export",
            "feedback.revision_pending!=true",
            "Apply pending revisions before exporting",
        )?
        .with_redirect("feedback_revise"),
    ];
    GuardTable::new(rules, catalog)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_catalog_has_22_steps() {
        let catalog = StepCatalog::standard().unwrap();
        assert_eq!(catalog.len(), 22);
        assert_eq!(catalog.first().id, "auth_login");
        assert_eq!(catalog.last().id, "project_complete");
    }

    #[test]
    fn every_phase_is_populated() {
        let catalog = StepCatalog::standard().unwrap();
        for phase in Phase::ALL {
            assert!(!catalog.steps_in_phase(phase).is_empty(), "{phase} is empty");
        }
        assert_eq!(catalog.steps_in_phase(Phase::Planning).len(), 5);
    }

    #[test]
    fn standard_guards_build() {
        let catalog = StepCatalog::standard().unwrap();
        let guards = standard_guards(&catalog).unwrap();
        assert_eq!(guards.len(), 6);
        let approved = guards.get("video_review", "feedback_share").unwrap();
        assert!(approved.allow_skip_override);
        assert_eq!(approved.reads(), vec!["video.approved"]);
    }

    #[test]
    fn weights_sum() {
        let catalog = StepCatalog::standard().unwrap();
        assert_eq!(catalog.total_weight(), 52);
    }
}
