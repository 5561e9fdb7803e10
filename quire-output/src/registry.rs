use crate::error::Error;
use crate::lock;
use crate::renderer::Renderer;
use crate::renderers;
use indexmap::IndexMap;
use std::fmt;
use std::sync::{Arc, Mutex};

/// A strategy that renders source text.
pub type TextRenderer = Arc<dyn Renderer<str>>;

/// Type-keyed renderer registrations.
///
/// Types are case-insensitive. Registering a type that is already present
/// shadows the current registration; removing the active registration
/// restores the one it shadowed.
#[derive(Clone, Default)]
pub struct RendererRegistry {
    entries: Arc<Mutex<IndexMap<String, Vec<TextRenderer>>>>,
}

impl fmt::Debug for RendererRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RendererRegistry")
            .field("types", &self.types())
            .finish()
    }
}

fn canonical_type(type_name: &str) -> Result<String, Error> {
    let canonical = type_name.trim().to_lowercase();
    if canonical.is_empty() || canonical.chars().any(char::is_whitespace) {
        return Err(Error::InvalidType(type_name.to_string()));
    }
    Ok(canonical)
}

impl RendererRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The text strategies every session starts with.
    pub fn builtin_text_renderers() -> Vec<TextRenderer> {
        vec![
            Arc::new(renderers::TextRenderer),
            Arc::new(renderers::MarkdownRenderer),
            Arc::new(renderers::LatexRenderer),
            Arc::new(renderers::ScriptRenderer),
        ]
    }

    pub fn with_builtin_text_renderers() -> Self {
        let registry = Self::new();
        for renderer in Self::builtin_text_renderers() {
            // Built-in type names are valid.
            let _ = registry.add(renderer);
        }
        registry
    }

    pub fn add(&self, renderer: TextRenderer) -> Result<(), Error> {
        let type_name = canonical_type(renderer.type_name())?;
        lock(&self.entries)
            .entry(type_name)
            .or_default()
            .push(renderer);
        Ok(())
    }

    /// Remove `renderer`, which must be the active registration for its type.
    pub fn remove(&self, renderer: &TextRenderer) -> Result<(), Error> {
        let type_name = canonical_type(renderer.type_name())?;
        let mut entries = lock(&self.entries);
        let Some(stack) = entries.get_mut(&type_name) else {
            return Err(Error::NotRegistered(type_name));
        };
        match stack.last() {
            Some(active) if Arc::ptr_eq(active, renderer) => {
                stack.pop();
            }
            _ => return Err(Error::NotRegistered(type_name)),
        }
        if stack.is_empty() {
            entries.shift_remove(&type_name);
        }
        Ok(())
    }

    pub fn get(&self, type_name: &str) -> Option<TextRenderer> {
        let type_name = canonical_type(type_name).ok()?;
        lock(&self.entries)
            .get(&type_name)
            .and_then(|stack| stack.last().cloned())
    }

    /// Registered types in first-registration order.
    pub fn types(&self) -> Vec<String> {
        lock(&self.entries).keys().cloned().collect()
    }

    /// The active renderer of every registered type.
    pub fn renderers(&self) -> Vec<TextRenderer> {
        lock(&self.entries)
            .values()
            .filter_map(|stack| stack.last().cloned())
            .collect()
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }

    /// Drop every registration and register `initial` instead.
    pub fn reset(&self, initial: impl IntoIterator<Item = TextRenderer>) -> Result<(), Error> {
        self.clear();
        for renderer in initial {
            self.add(renderer)?;
        }
        Ok(())
    }
}
