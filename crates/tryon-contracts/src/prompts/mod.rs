//! Deterministic prompt rendering.
//!
//! Directive order matters: the single override (a color or the body-build
//! category) always comes first, then preservation rules, then styling,
//! then free-form notes. The remote models are assumed to weight earlier
//! instructions more heavily; that assumption is not verified.

mod templates;

use crate::features::{FeatureKind, GenerationOptions};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct PromptPlan {
    pub override_directive: Option<String>,
    pub task: String,
    pub preserve: Vec<String>,
    pub styling: Vec<String>,
    pub notes: Option<String>,
    pub avoid: Vec<String>,
}

impl PromptPlan {
    fn render(&self) -> String {
        let mut paragraphs: Vec<String> = Vec::new();
        if let Some(directive) = self.override_directive.as_deref() {
            paragraphs.push(collapse(directive));
        }
        paragraphs.push(collapse(&self.task));
        if !self.preserve.is_empty() || !self.styling.is_empty() {
            let numbered = self
                .preserve
                .iter()
                .chain(self.styling.iter())
                .enumerate()
                .map(|(idx, line)| format!("{}. {}", idx + 1, collapse(line)))
                .collect::<Vec<String>>()
                .join(" ");
            paragraphs.push(format!("Instructions in order of importance: {numbered}"));
        }
        if let Some(notes) = self.notes.as_deref() {
            paragraphs.push(collapse(notes));
        }
        if !self.avoid.is_empty() {
            let avoid = self
                .avoid
                .iter()
                .map(|line| collapse(line))
                .collect::<Vec<String>>()
                .join(" ");
            paragraphs.push(avoid);
        }
        paragraphs.join("\n\n")
    }
}

/// Renders the instruction text for `feature`. `has_reference` selects the
/// reference-image variant of the template over the text-description one.
pub fn build_prompt(feature: FeatureKind, options: &GenerationOptions, has_reference: bool) -> String {
    let plan = match feature {
        FeatureKind::VirtualTryOn => templates::virtual_try_on(options, has_reference),
        FeatureKind::HairStyle => templates::hair_style(options, has_reference),
        FeatureKind::Background => templates::background(options, has_reference),
    };
    plan.render()
}

// Template literals are wrapped across lines; keep single spaces only.
fn collapse(text: &str) -> String {
    text.split_whitespace().collect::<Vec<&str>>().join(" ")
}

#[cfg(test)]
mod tests {
    use crate::features::{
        CameraAngle, FeatureKind, Gender, GenerationOptions, HexColor, PlacementMode,
    };

    use super::build_prompt;

    fn colored() -> GenerationOptions {
        GenerationOptions {
            body_build: Some("Athletic".to_string()),
            color_override: HexColor::parse("#1a2b3c").ok(),
            ..GenerationOptions::default()
        }
    }

    #[test]
    fn identical_inputs_render_identical_text() {
        for feature in [
            FeatureKind::VirtualTryOn,
            FeatureKind::HairStyle,
            FeatureKind::Background,
        ] {
            for has_reference in [true, false] {
                let first = build_prompt(feature, &colored(), has_reference);
                let second = build_prompt(feature, &colored(), has_reference);
                assert_eq!(first, second);
                assert!(!first.is_empty());
            }
        }
    }

    #[test]
    fn color_override_precedes_styling() {
        let prompt = build_prompt(FeatureKind::VirtualTryOn, &colored(), true);
        let color_idx = prompt.find("#1A2B3C").unwrap_or(usize::MAX);
        let styling_idx = prompt.find("Fit the outfit").unwrap_or(0);
        let preserve_idx = prompt.find("Preserve the subject's face").unwrap_or(0);
        assert!(color_idx < preserve_idx);
        assert!(preserve_idx < styling_idx);
        assert!(prompt.starts_with("Absolute priority: recolor"));
    }

    #[test]
    fn body_build_leads_when_no_color_is_given() {
        let options = GenerationOptions {
            body_build: Some("Curvy".to_string()),
            ..GenerationOptions::default()
        };
        let prompt = build_prompt(FeatureKind::VirtualTryOn, &options, true);
        assert!(prompt.starts_with("Body type fidelity: the person has a Curvy build."));
        assert_eq!(prompt.matches("Body type fidelity").count(), 1);
    }

    #[test]
    fn body_build_follows_color_override() {
        let prompt = build_prompt(FeatureKind::VirtualTryOn, &colored(), true);
        let color_idx = prompt.find("recolor").unwrap_or(usize::MAX);
        let build_idx = prompt.find("Body type fidelity").unwrap_or(0);
        assert!(color_idx < build_idx);
    }

    #[test]
    fn reference_and_description_variants_differ() {
        let options = GenerationOptions {
            style_description: Some("a short bob".to_string()),
            gender: Gender::Female,
            ..GenerationOptions::default()
        };
        let with_reference = build_prompt(FeatureKind::HairStyle, &options, true);
        let described = build_prompt(FeatureKind::HairStyle, &options, false);
        assert_ne!(with_reference, described);
        assert!(with_reference.contains("reference image"));
        assert!(described.contains("Give this person a new hairstyle: a short bob."));
        assert!(described.contains("feminine facial features"));
    }

    #[test]
    fn hair_description_defaults_when_blank() {
        let prompt = build_prompt(FeatureKind::HairStyle, &GenerationOptions::default(), false);
        assert!(prompt.contains("a modern, stylish haircut"));
    }

    #[test]
    fn manual_placement_needs_instructions() {
        let mut options = GenerationOptions {
            background_description: Some("a beach at sunset".to_string()),
            placement: PlacementMode::Manual,
            placement_instructions: Some("standing on the left near the water".to_string()),
            ..GenerationOptions::default()
        };
        let manual = build_prompt(FeatureKind::Background, &options, false);
        assert!(manual.contains("Position them as follows: standing on the left near the water."));

        options.placement_instructions = None;
        let auto = build_prompt(FeatureKind::Background, &options, false);
        assert!(auto.contains("where they naturally belong"));
    }

    #[test]
    fn custom_notes_come_after_instructions() {
        let options = GenerationOptions {
            angle: CameraAngle::Side,
            custom_prompt: Some("roll up the sleeves".to_string()),
            ..GenerationOptions::default()
        };
        let prompt = build_prompt(FeatureKind::VirtualTryOn, &options, true);
        let notes_idx = prompt.find("Additional styling: roll up the sleeves").unwrap_or(0);
        let instructions_idx = prompt.find("Instructions in order of importance").unwrap_or(usize::MAX);
        assert!(instructions_idx < notes_idx);
        assert!(prompt.contains("side profile view"));
    }

    #[test]
    fn output_is_plain_paragraphs() {
        let prompt = build_prompt(FeatureKind::VirtualTryOn, &colored(), true);
        assert!(!prompt.contains("**"));
        assert!(!prompt.contains('#') || prompt.matches('#').count() == prompt.matches("#1A2B3C").count());
        assert!(!prompt.contains("  "));
        assert!(!prompt.starts_with(char::is_whitespace));
        assert!(!prompt.ends_with(char::is_whitespace));
    }
}
