//! Built-in model catalog.
//!
//! Small instruction-tuned models that run acceptably on commodity
//! hardware.  User-added models live alongside these in the registry but
//! are created through `add_model` instead.

use super::ModelDescriptor;

/// Descriptors seeded into every registry at construction, in display
/// order.
pub fn builtin_models() -> Vec<ModelDescriptor> {
    vec![
        ModelDescriptor::built_in(
            "qwen2.5-1.5b-instruct-q4",
            "https://huggingface.co/Qwen/Qwen2.5-1.5B-Instruct-GGUF/resolve/main/qwen2.5-1.5b-instruct-q4_k_m.gguf",
            "llama-cpp/chatml",
        ),
        ModelDescriptor::built_in(
            "phi-3-mini-4k-instruct-q4",
            "https://huggingface.co/microsoft/Phi-3-mini-4k-instruct-gguf/resolve/main/Phi-3-mini-4k-instruct-q4.gguf",
            "llama-cpp/phi3",
        ),
        ModelDescriptor::built_in(
            "tinyllama-1.1b-chat-q4",
            "https://huggingface.co/TheBloke/TinyLlama-1.1B-Chat-v1.0-GGUF/resolve/main/tinyllama-1.1b-chat-v1.0.Q4_K_M.gguf",
            "llama-cpp/zephyr",
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LoadState, ModelOrigin};
    use std::collections::HashSet;

    #[test]
    fn catalog_ids_are_unique_and_complete() {
        let models = builtin_models();
        assert!(!models.is_empty());

        let ids: HashSet<_> = models.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids.len(), models.len());

        for m in &models {
            assert!(matches!(m.origin, ModelOrigin::BuiltIn));
            assert!(matches!(m.load_state, LoadState::Unloaded));
            assert!(!m.source_locator.trim().is_empty());
            assert!(!m.library_locator.trim().is_empty());
        }
    }
}
