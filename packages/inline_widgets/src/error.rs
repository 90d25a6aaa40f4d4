use crate::markers::WidgetId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WidgetError {
    #[error("widget {0} not found")]
    NotFound(WidgetId),
}
