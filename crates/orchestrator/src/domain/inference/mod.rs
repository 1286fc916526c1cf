//! Inference server engines, one per runtime.

pub mod kubernetes;
pub mod podman;
pub mod proxy;

use api_types::{InferenceType, ModelInfo};

pub use kubernetes::{KubernetesInferenceManager, PodDetails, PodProviders};
pub use podman::{ContainerDetails, ContainerProviders, PodmanInferenceManager};
pub use proxy::{ProxyHandle, ProxyTable};

/// Backend shared by every model, or [`InferenceType::None`] when the
/// models disagree or declare none.
pub fn inference_type_of(models: &[ModelInfo]) -> InferenceType {
    let mut backends = models.iter().map(|m| m.backend.unwrap_or_default());
    let Some(first) = backends.next() else {
        return InferenceType::None;
    };
    if backends.all(|b| b == first) {
        first
    } else {
        InferenceType::None
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::testing::model;

    #[test]
    fn mixed_backends_have_no_inference_type() {
        let llama = model("granite");
        let mut whisper = model("whisper-small");
        whisper.backend = Some(InferenceType::WhisperCpp);

        assert_eq!(inference_type_of(&[llama.clone(), llama.clone()]), InferenceType::LlamaCpp);
        assert_eq!(inference_type_of(&[llama, whisper]), InferenceType::None);
        assert_eq!(inference_type_of(&[]), InferenceType::None);
    }
}
