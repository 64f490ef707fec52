use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub const MAX_PROMPT_CHARS: usize = 800;
pub const MIN_EXPAND_SCALE: f64 = 0.5;
pub const MAX_EXPAND_SCALE: f64 = 3.0;
pub const MIN_UPSCALE_FACTOR: u64 = 2;
pub const MAX_UPSCALE_FACTOR: u64 = 4;
pub const MIN_IMAGE_COUNT: u64 = 1;
pub const MAX_IMAGE_COUNT: u64 = 4;

pub const DEFAULT_EDIT_MODEL: &str = "wanx2.1-imageedit";
pub const DEFAULT_TEXT_TO_IMAGE_MODEL: &str = "wan2.2-t2i-plus";
pub const DEFAULT_IMAGE_SIZE: &str = "1024*1024";
pub const DEFAULT_EXPAND_SCALE: f64 = 1.5;
pub const DEFAULT_UPSCALE_FACTOR: u64 = 2;
/// Fixed seed sent with every text-to-image submission so repeated prompts
/// stay comparable across runs.
pub const DEFAULT_SEED: i64 = 171126;

/// The closed set of edit operations the image2image endpoint accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditFunction {
    StylizationAll,
    StylizationLocal,
    DescriptionEdit,
    DescriptionEditWithMask,
    RemoveWatermark,
    Inpainting,
    Expand,
    SuperResolution,
    Colorization,
    Doodle,
    ControlCartoonFeature,
}

impl EditFunction {
    pub const ALL: [EditFunction; 11] = [
        EditFunction::StylizationAll,
        EditFunction::StylizationLocal,
        EditFunction::DescriptionEdit,
        EditFunction::DescriptionEditWithMask,
        EditFunction::RemoveWatermark,
        EditFunction::Inpainting,
        EditFunction::Expand,
        EditFunction::SuperResolution,
        EditFunction::Colorization,
        EditFunction::Doodle,
        EditFunction::ControlCartoonFeature,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EditFunction::StylizationAll => "stylization_all",
            EditFunction::StylizationLocal => "stylization_local",
            EditFunction::DescriptionEdit => "description_edit",
            EditFunction::DescriptionEditWithMask => "description_edit_with_mask",
            EditFunction::RemoveWatermark => "remove_watermark",
            EditFunction::Inpainting => "inpainting",
            EditFunction::Expand => "expand",
            EditFunction::SuperResolution => "super_resolution",
            EditFunction::Colorization => "colorization",
            EditFunction::Doodle => "doodle",
            EditFunction::ControlCartoonFeature => "control_cartoon_feature",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            EditFunction::StylizationAll => "global stylization",
            EditFunction::StylizationLocal => "local stylization",
            EditFunction::DescriptionEdit => "instruction edit",
            EditFunction::DescriptionEditWithMask => "masked repaint",
            EditFunction::RemoveWatermark => "watermark removal",
            EditFunction::Inpainting => "inpainting",
            EditFunction::Expand => "outpainting",
            EditFunction::SuperResolution => "super resolution",
            EditFunction::Colorization => "colorization",
            EditFunction::Doodle => "sketch to image",
            EditFunction::ControlCartoonFeature => "cartoon character control",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            EditFunction::StylizationAll => "Restyle the whole image after a named style.",
            EditFunction::StylizationLocal => "Restyle a specific part of the image.",
            EditFunction::DescriptionEdit => {
                "Modify image content following a written instruction."
            }
            EditFunction::DescriptionEditWithMask => {
                "Repaint the masked region following a written instruction."
            }
            EditFunction::RemoveWatermark => "Remove watermarks and overlaid text.",
            EditFunction::Inpainting => "Repair defects inside the masked region.",
            EditFunction::Expand => {
                "Extend the image in all four directions with configurable scales."
            }
            EditFunction::SuperResolution => {
                "Raise image resolution by a configurable upscale factor."
            }
            EditFunction::Colorization => "Colorize a black-and-white image from the prompt.",
            EditFunction::Doodle => "Turn a line sketch or doodle into a full image.",
            EditFunction::ControlCartoonFeature => {
                "Generate images guided by a reference cartoon character."
            }
        }
    }

    pub fn needs_mask(&self) -> bool {
        matches!(
            self,
            EditFunction::DescriptionEditWithMask | EditFunction::Inpainting
        )
    }

    pub fn needs_expand(&self) -> bool {
        matches!(self, EditFunction::Expand)
    }

    pub fn needs_upscale(&self) -> bool {
        matches!(self, EditFunction::SuperResolution)
    }
}

impl Default for EditFunction {
    fn default() -> Self {
        EditFunction::StylizationAll
    }
}

impl fmt::Display for EditFunction {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl FromStr for EditFunction {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        EditFunction::ALL
            .iter()
            .find(|function| function.as_str() == normalized)
            .copied()
            .ok_or_else(|| {
                let names: Vec<&str> = EditFunction::ALL
                    .iter()
                    .map(EditFunction::as_str)
                    .collect();
                format!(
                    "unknown edit function '{value}' (expected one of: {})",
                    names.join(", ")
                )
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ImageEditRequest {
    pub image_url: String,
    pub prompt: String,
    #[serde(default)]
    pub function: EditFunction,
    pub mask_url: Option<String>,
    pub n: Option<u64>,
    pub top_scale: Option<f64>,
    pub bottom_scale: Option<f64>,
    pub left_scale: Option<f64>,
    pub right_scale: Option<f64>,
    pub upscale_factor: Option<u64>,
    pub model: Option<String>,
}

impl ImageEditRequest {
    pub fn validate(&self) -> Validation {
        let mut errors = Vec::new();

        if self.image_url.trim().is_empty() {
            errors.push("image URL is required".to_string());
        }
        if self.prompt.trim().is_empty() {
            errors.push("prompt is required".to_string());
        }
        if self.prompt.chars().count() > MAX_PROMPT_CHARS {
            errors.push(format!(
                "prompt must be {MAX_PROMPT_CHARS} characters or fewer"
            ));
        }

        if self.function.needs_mask() && self.mask_url.as_deref().unwrap_or("").trim().is_empty() {
            errors.push(format!(
                "{} requires a mask image URL",
                self.function.as_str()
            ));
        }

        if self.function.needs_expand() {
            let scales = [
                ("top", self.top_scale),
                ("bottom", self.bottom_scale),
                ("left", self.left_scale),
                ("right", self.right_scale),
            ];
            for (side, scale) in scales {
                if let Some(value) = scale {
                    if !(MIN_EXPAND_SCALE..=MAX_EXPAND_SCALE).contains(&value) {
                        errors.push(format!(
                            "{side} expand scale must be between {MIN_EXPAND_SCALE} and {MAX_EXPAND_SCALE}"
                        ));
                    }
                }
            }
        }

        if self.function.needs_upscale() {
            if let Some(factor) = self.upscale_factor {
                if !(MIN_UPSCALE_FACTOR..=MAX_UPSCALE_FACTOR).contains(&factor) {
                    errors.push(format!(
                        "upscale factor must be between {MIN_UPSCALE_FACTOR} and {MAX_UPSCALE_FACTOR}"
                    ));
                }
            }
        }

        if let Some(count) = self.n {
            if !(MIN_IMAGE_COUNT..=MAX_IMAGE_COUNT).contains(&count) {
                errors.push(format!(
                    "image count must be between {MIN_IMAGE_COUNT} and {MAX_IMAGE_COUNT}"
                ));
            }
        }

        Validation::from_errors(errors)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TextToImageRequest {
    pub prompt: String,
    pub size: Option<String>,
    pub n: Option<u64>,
    pub seed: Option<i64>,
    pub model: Option<String>,
}

impl TextToImageRequest {
    pub fn validate(&self) -> Validation {
        let mut errors = Vec::new();

        if self.prompt.trim().is_empty() {
            errors.push("prompt is required".to_string());
        }
        if self.prompt.chars().count() > MAX_PROMPT_CHARS {
            errors.push(format!(
                "prompt must be {MAX_PROMPT_CHARS} characters or fewer"
            ));
        }
        if let Some(count) = self.n {
            if !(MIN_IMAGE_COUNT..=MAX_IMAGE_COUNT).contains(&count) {
                errors.push(format!(
                    "image count must be between {MIN_IMAGE_COUNT} and {MAX_IMAGE_COUNT}"
                ));
            }
        }

        Validation::from_errors(errors)
    }
}

/// Aggregated validator outcome: every violated rule contributes a message,
/// none of them short-circuits the rest.
#[derive(Debug, Clone, PartialEq)]
pub struct Validation {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl Validation {
    pub fn from_errors(errors: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }
}
