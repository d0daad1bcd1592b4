use beacon_common::error::RenderError;

/// Output of a single render pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Render<V> {
    /// Data the component depends on has not arrived yet.
    Loading,
    Ready(V),
}

/// A renderable subtree. Errors may be returned or raised as panics; the
/// boundary treats both the same way.
pub trait Component: Send + 'static {
    type View: Send + 'static;

    fn render(&mut self) -> Result<Render<Self::View>, RenderError>;
}
