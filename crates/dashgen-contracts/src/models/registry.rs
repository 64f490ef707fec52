use indexmap::IndexMap;

use crate::requests::EditFunction;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub description: String,
    pub capabilities: Vec<String>,
    pub version: Option<String>,
    pub tier: Option<String>,
    pub recommended: bool,
}

impl ModelSpec {
    pub fn supports(&self, capability: &str) -> bool {
        let needle = capability.trim().to_ascii_lowercase();
        self.capabilities
            .iter()
            .any(|item| item.to_ascii_lowercase().contains(&needle))
    }
}

/// Static, insertion-ordered catalog of vendor models. Never mutated at
/// runtime.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl ModelRegistry {
    pub fn text_to_image() -> Self {
        Self {
            models: default_text_to_image_models(),
        }
    }

    pub fn image_edit() -> Self {
        Self {
            models: default_image_edit_models(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models
            .values()
            .find(|model| model.name.eq_ignore_ascii_case(name.trim()))
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn recommended(&self) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.recommended)
            .cloned()
            .collect()
    }

    pub fn by_capability(&self, capability: &str) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.supports(capability))
            .cloned()
            .collect()
    }

    pub fn capabilities(&self) -> Vec<String> {
        let mut all: Vec<String> = Vec::new();
        for model in self.models.values() {
            for capability in &model.capabilities {
                if !all.contains(capability) {
                    all.push(capability.clone());
                }
            }
        }
        all.sort();
        all
    }
}

fn default_text_to_image_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();

    let mut insert =
        |name: &str, version: &str, tier: &str, recommended: bool, description: &str| {
            map.insert(
                name.to_string(),
                ModelSpec {
                    name: name.to_string(),
                    description: description.to_string(),
                    capabilities: vec!["text2image".to_string()],
                    version: Some(version.to_string()),
                    tier: Some(tier.to_string()),
                    recommended,
                },
            );
        };

    insert(
        "wan2.5-t2i-preview",
        "2.5",
        "pro",
        true,
        "Preview of the 2.5 architecture. Markedly better aesthetics, design \
         sense and realistic texture, precise instruction following, strong \
         multilingual text rendering, and support for long structured prompts, \
         charts and diagrams.",
    );
    insert(
        "wan2.2-t2i-flash",
        "2.2",
        "turbo",
        true,
        "Fast 2.2 model. Upgraded creativity, stability and photorealism with \
         quick generation at low cost.",
    );
    insert(
        "wan2.2-t2i-plus",
        "2.2",
        "pro",
        true,
        "Professional 2.2 model, the current default. Upgraded creativity, \
         stability and photorealism with rich generated detail.",
    );
    insert(
        "wanx2.1-t2i-turbo",
        "2.1",
        "turbo",
        false,
        "Fast 2.1 model. Quick generation with balanced quality.",
    );
    insert(
        "wanx2.1-t2i-plus",
        "2.1",
        "pro",
        false,
        "Professional 2.1 model. Richer image detail, slightly slower.",
    );
    insert(
        "wanx2.0-t2i-turbo",
        "2.0",
        "turbo",
        false,
        "Fast 2.0 model. Strong on textured portraits and creative design, \
         good value.",
    );
    insert(
        "wanx-v1",
        "2.0",
        "turbo",
        false,
        "First-generation text-to-image model. Bilingual prompts; styles \
         include watercolor, oil painting, Chinese painting, sketch, flat \
         illustration, anime and 3D cartoon.",
    );

    map
}

fn default_image_edit_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();
    map.insert(
        "wanx2.1-imageedit".to_string(),
        ModelSpec {
            name: "wanx2.1-imageedit".to_string(),
            description: "General-purpose image edit model supporting every edit function."
                .to_string(),
            capabilities: EditFunction::ALL
                .iter()
                .map(|function| function.as_str().to_string())
                .collect(),
            version: Some("2.1".to_string()),
            tier: None,
            recommended: true,
        },
    );
    map
}
