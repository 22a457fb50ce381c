use crate::config::GlassConfig;
use crate::gpu::{GpuResource, ResourceId};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum AlphaMode {
    #[default]
    Opaque,
    Mask,
    Blend,
}

impl AlphaMode {
    fn tag(self) -> u8 {
        match self {
            AlphaMode::Opaque => 0,
            AlphaMode::Mask => 1,
            AlphaMode::Blend => 2,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureSlot {
    BaseColor,
    MetallicRoughness,
    Normal,
    Emissive,
}

impl TextureSlot {
    pub fn srgb(self) -> bool {
        matches!(self, TextureSlot::BaseColor | TextureSlot::Emissive)
    }

    fn tag(self) -> u8 {
        match self {
            TextureSlot::BaseColor => 0,
            TextureSlot::MetallicRoughness => 1,
            TextureSlot::Normal => 2,
            TextureSlot::Emissive => 3,
        }
    }
}

/// RGBA8 pixel data decoded from a model file.
#[derive(Debug)]
pub struct Texture {
    id: ResourceId,
    width: u32,
    height: u32,
    data: Vec<u8>,
    digest: [u8; 32],
}

impl Texture {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&width.to_le_bytes());
        hasher.update(&height.to_le_bytes());
        hasher.update(&data);
        Self { id: ResourceId::new(), width, height, data, digest: *hasher.finalize().as_bytes() }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn digest(&self) -> &[u8; 32] {
        &self.digest
    }
}

#[derive(Clone, Debug)]
pub struct TextureBinding {
    pub slot: TextureSlot,
    pub texture: Arc<Texture>,
    pub tex_coord: u32,
    pub scale: f32,
}

#[derive(Clone, Debug)]
pub struct MaterialDefinition {
    pub name: String,
    pub base_color_factor: [f32; 4],
    pub metallic_factor: f32,
    pub roughness_factor: f32,
    pub emissive_factor: [f32; 3],
    pub alpha_mode: AlphaMode,
    pub alpha_cutoff: Option<f32>,
    pub transmission_factor: Option<f32>,
    pub double_sided: bool,
    pub textures: Vec<TextureBinding>,
}

impl Default for MaterialDefinition {
    fn default() -> Self {
        Self {
            name: "Default".to_string(),
            base_color_factor: [1.0, 1.0, 1.0, 1.0],
            metallic_factor: 0.0,
            roughness_factor: 1.0,
            emissive_factor: [0.0, 0.0, 0.0],
            alpha_mode: AlphaMode::Opaque,
            alpha_cutoff: None,
            transmission_factor: None,
            double_sided: false,
            textures: Vec::new(),
        }
    }
}

/// Content digest of a material; two materials with the same fingerprint
/// render identically.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MaterialFingerprint([u8; 32]);

impl MaterialFingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

#[derive(Debug)]
pub struct Material {
    id: ResourceId,
    definition: MaterialDefinition,
    fingerprint: MaterialFingerprint,
}

impl Material {
    pub fn new(definition: MaterialDefinition) -> Self {
        let fingerprint = fingerprint(&definition);
        Self { id: ResourceId::new(), definition, fingerprint }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &MaterialDefinition {
        &self.definition
    }

    pub fn fingerprint(&self) -> MaterialFingerprint {
        self.fingerprint
    }

    pub fn opacity(&self) -> f32 {
        self.definition.base_color_factor[3]
    }

    pub fn is_transparent(&self) -> bool {
        self.definition.alpha_mode == AlphaMode::Blend
    }

    pub fn transmission(&self) -> f32 {
        self.definition.transmission_factor.unwrap_or(0.0)
    }

    /// The material itself plus every texture it samples.
    pub fn gpu_resources(&self) -> impl Iterator<Item = GpuResource> + '_ {
        std::iter::once(GpuResource::Material(self.id))
            .chain(self.definition.textures.iter().map(|binding| GpuResource::Texture(binding.texture.id())))
    }
}

fn fingerprint(definition: &MaterialDefinition) -> MaterialFingerprint {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(definition.name.len() as u64).to_le_bytes());
    hasher.update(definition.name.as_bytes());
    for value in definition.base_color_factor {
        hasher.update(&value.to_le_bytes());
    }
    hasher.update(&definition.metallic_factor.to_le_bytes());
    hasher.update(&definition.roughness_factor.to_le_bytes());
    for value in definition.emissive_factor {
        hasher.update(&value.to_le_bytes());
    }
    hasher.update(&[definition.alpha_mode.tag(), definition.double_sided as u8]);
    match definition.alpha_cutoff {
        Some(cutoff) => hasher.update(&[1]).update(&cutoff.to_le_bytes()),
        None => hasher.update(&[0]),
    };
    match definition.transmission_factor {
        Some(factor) => hasher.update(&[1]).update(&factor.to_le_bytes()),
        None => hasher.update(&[0]),
    };
    hasher.update(&(definition.textures.len() as u32).to_le_bytes());
    for binding in &definition.textures {
        hasher.update(&[binding.slot.tag()]);
        hasher.update(&binding.tex_coord.to_le_bytes());
        hasher.update(&binding.scale.to_le_bytes());
        hasher.update(binding.texture.digest());
    }
    MaterialFingerprint(*hasher.finalize().as_bytes())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaterialClass {
    Mergeable,
    /// Rendered as authored; never merged into an instance group.
    Exempt,
}

/// Decides which materials may be batched. Glass-like transparent materials
/// are kept out so transparency sorting stays per mesh.
#[derive(Clone, Debug)]
pub struct MaterialClassifier {
    opacity_threshold: f32,
    transmission_threshold: f32,
    keywords: Vec<String>,
}

impl MaterialClassifier {
    pub fn new(config: &GlassConfig) -> Self {
        Self {
            opacity_threshold: config.opacity_threshold,
            transmission_threshold: config.transmission_threshold,
            keywords: config.keywords.iter().map(|k| k.to_lowercase()).filter(|k| !k.is_empty()).collect(),
        }
    }

    pub fn classify(&self, material: &Material) -> MaterialClass {
        if !material.is_transparent() {
            return MaterialClass::Mergeable;
        }
        let low_opacity = material.opacity() < self.opacity_threshold;
        let transmissive = material.transmission() > self.transmission_threshold;
        let named_glass = {
            let name = material.name().to_lowercase();
            self.keywords.iter().any(|keyword| name.contains(keyword.as_str()))
        };
        if low_opacity || transmissive || named_glass {
            MaterialClass::Exempt
        } else {
            MaterialClass::Mergeable
        }
    }

    pub fn is_exempt(&self, material: &Material) -> bool {
        self.classify(material) == MaterialClass::Exempt
    }
}

impl Default for MaterialClassifier {
    fn default() -> Self {
        Self::new(&GlassConfig::default())
    }
}
