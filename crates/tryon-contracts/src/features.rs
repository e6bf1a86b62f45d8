use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FeatureKind {
    VirtualTryOn,
    HairStyle,
    Background,
}

impl FeatureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureKind::VirtualTryOn => "virtual-try-on",
            FeatureKind::HairStyle => "hair-style",
            FeatureKind::Background => "background",
        }
    }

    pub fn requires_reference(&self) -> bool {
        matches!(self, FeatureKind::VirtualTryOn)
    }
}

impl fmt::Display for FeatureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeatureKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "virtual-try-on" | "virtual-tryon" | "tryon" | "try-on" => Ok(FeatureKind::VirtualTryOn),
            "hair-style" | "hairstyle" | "hair" => Ok(FeatureKind::HairStyle),
            "background" | "bg" => Ok(FeatureKind::Background),
            other => Err(format!("unknown feature '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CameraAngle {
    #[default]
    Front,
    Side,
    #[serde(rename = "3quarter")]
    ThreeQuarter,
    Back,
}

impl CameraAngle {
    pub fn portrait_phrase(&self) -> &'static str {
        match self {
            CameraAngle::Front => "front-facing",
            CameraAngle::Side => "side profile",
            CameraAngle::ThreeQuarter => "3/4 angle",
            CameraAngle::Back => "back-facing",
        }
    }
}

impl FromStr for CameraAngle {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "front" => Ok(CameraAngle::Front),
            "side" => Ok(CameraAngle::Side),
            "3quarter" | "three-quarter" | "3/4" => Ok(CameraAngle::ThreeQuarter),
            "back" => Ok(CameraAngle::Back),
            other => Err(format!("unknown camera angle '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Gender {
    Male,
    Female,
    #[default]
    Unisex,
}

impl Gender {
    pub fn feature_phrase(&self) -> &'static str {
        match self {
            Gender::Male => "masculine",
            Gender::Female => "feminine",
            Gender::Unisex => "their",
        }
    }
}

impl FromStr for Gender {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "male" => Ok(Gender::Male),
            "female" => Ok(Gender::Female),
            "unisex" | "any" => Ok(Gender::Unisex),
            other => Err(format!("unknown gender preference '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlacementMode {
    #[default]
    Auto,
    Manual,
}

impl FromStr for PlacementMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(PlacementMode::Auto),
            "manual" => Ok(PlacementMode::Manual),
            other => Err(format!("unknown placement mode '{other}'")),
        }
    }
}

/// A `#RRGGBB` colour, stored upper-case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HexColor(String);

impl HexColor {
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let trimmed = raw.trim();
        let digits = trimmed.strip_prefix('#').unwrap_or(trimmed);
        if digits.len() != 6 || !digits.chars().all(|ch| ch.is_ascii_hexdigit()) {
            return Err(ValidationError::InvalidColor {
                raw: raw.to_string(),
            });
        }
        Ok(Self(format!("#{}", digits.to_ascii_uppercase())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for HexColor {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<HexColor> for String {
    fn from(value: HexColor) -> Self {
        value.0
    }
}

impl fmt::Display for HexColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub const DEFAULT_BODY_BUILD: &str = "Average";
pub const DEFAULT_HAIR_STYLE: &str = "a modern, stylish haircut";
pub const DEFAULT_BACKGROUND: &str = "a beautiful outdoor setting";

/// Feature-specific knobs. Fields that do not apply to a feature are ignored
/// by the prompt builder.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GenerationOptions {
    pub body_build: Option<String>,
    #[serde(default)]
    pub angle: CameraAngle,
    #[serde(default)]
    pub gender: Gender,
    pub style_description: Option<String>,
    pub background_description: Option<String>,
    #[serde(default)]
    pub placement: PlacementMode,
    pub placement_instructions: Option<String>,
    pub custom_prompt: Option<String>,
    pub color_override: Option<HexColor>,
}

impl GenerationOptions {
    pub fn body_build(&self) -> &str {
        non_empty(self.body_build.as_deref()).unwrap_or(DEFAULT_BODY_BUILD)
    }

    pub fn style_description(&self) -> Option<&str> {
        non_empty(self.style_description.as_deref())
    }

    pub fn background_description(&self) -> Option<&str> {
        non_empty(self.background_description.as_deref())
    }

    pub fn placement_instructions(&self) -> Option<&str> {
        non_empty(self.placement_instructions.as_deref())
    }

    pub fn custom_prompt(&self) -> Option<&str> {
        non_empty(self.custom_prompt.as_deref())
    }

    /// Text that can stand in for a missing reference image.
    pub fn description_for(&self, feature: FeatureKind) -> Option<&str> {
        match feature {
            FeatureKind::VirtualTryOn => self.custom_prompt(),
            FeatureKind::HairStyle => self.style_description().or_else(|| self.custom_prompt()),
            FeatureKind::Background => self
                .background_description()
                .or_else(|| self.custom_prompt()),
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

/// Download name for a finished result: `<feature>-<millis>.<ext>`.
pub fn artifact_file_name(feature: FeatureKind, timestamp_millis: i64, mime_type: &str) -> String {
    let ext = if mime_type.to_ascii_lowercase().contains("png") {
        "png"
    } else {
        "jpeg"
    };
    format!("{}-{}.{}", feature.as_str(), timestamp_millis, ext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_color_normalizes_and_rejects_garbage() {
        assert_eq!(HexColor::parse("#a1b2c3").map(|c| c.to_string()), Ok("#A1B2C3".to_string()));
        assert_eq!(HexColor::parse("ff0000").map(|c| c.to_string()), Ok("#FF0000".to_string()));
        assert!(HexColor::parse("#ff00").is_err());
        assert!(HexColor::parse("#gg0000").is_err());
    }

    #[test]
    fn only_try_on_requires_reference() {
        assert!(FeatureKind::VirtualTryOn.requires_reference());
        assert!(!FeatureKind::HairStyle.requires_reference());
        assert!(!FeatureKind::Background.requires_reference());
    }

    #[test]
    fn feature_names_parse_with_aliases() {
        assert_eq!("virtual-tryon".parse::<FeatureKind>(), Ok(FeatureKind::VirtualTryOn));
        assert_eq!("Hair".parse::<FeatureKind>(), Ok(FeatureKind::HairStyle));
        assert!("makeup".parse::<FeatureKind>().is_err());
    }

    #[test]
    fn blank_options_fall_back_to_defaults() {
        let options = GenerationOptions {
            body_build: Some("   ".to_string()),
            style_description: Some(String::new()),
            ..GenerationOptions::default()
        };
        assert_eq!(options.body_build(), DEFAULT_BODY_BUILD);
        assert_eq!(options.description_for(FeatureKind::HairStyle), None);
    }

    #[test]
    fn artifact_names_follow_feature_and_mime() {
        assert_eq!(
            artifact_file_name(FeatureKind::VirtualTryOn, 1700000000000, "image/jpeg"),
            "virtual-try-on-1700000000000.jpeg"
        );
        assert_eq!(
            artifact_file_name(FeatureKind::Background, 5, "image/png"),
            "background-5.png"
        );
    }

    #[test]
    fn options_deserialize_angle_alias() -> anyhow::Result<()> {
        let options: GenerationOptions =
            serde_json::from_str(r##"{"angle":"3quarter","color_override":"#00ff00"}"##)?;
        assert_eq!(options.angle, CameraAngle::ThreeQuarter);
        assert_eq!(options.color_override.map(String::from), Some("#00FF00".to_string()));
        Ok(())
    }
}
