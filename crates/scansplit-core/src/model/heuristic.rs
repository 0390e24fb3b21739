use serde_json::json;

use super::{ModelClient, ModelError, ModelFuture};
use crate::printed::reading_order;
use crate::prompt::parse_page_context;

/// Offline ordering backend that applies the printed-number sort locally.
///
/// It ignores the prompt and answers every call with a `page_order` object
/// built from the page context, so it is only useful for the ordering step.
pub struct HeuristicOrderer;

impl ModelClient for HeuristicOrderer {
    fn send<'a>(&'a self, _prompt: &'a str, context: &'a str) -> ModelFuture<'a> {
        Box::pin(async move {
            let pages = parse_page_context(context);
            if pages.is_empty() {
                return Err(ModelError::Transport(
                    "heuristic orderer received no page context".into(),
                ));
            }
            Ok(json!({ "page_order": reading_order(&pages) }).to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Page;
    use crate::prompt::{build_ordering_prompt, page_context};
    use crate::validate::validate_ordering;

    #[tokio::test]
    async fn answers_with_a_valid_page_order() {
        let pages = vec![
            Page::new(5, "Annex"),
            Page::new(8, "Note"),
            Page::new(10, "Signatures\n3"),
            Page::new(12, "Page 1\nTerms"),
        ];
        let raw = HeuristicOrderer
            .send(&build_ordering_prompt(&pages), &page_context(&pages))
            .await
            .unwrap();
        assert_eq!(validate_ordering(&raw, &[5, 8, 10, 12]).unwrap(), vec![12, 10, 5, 8]);
    }

    #[tokio::test]
    async fn empty_context_is_a_transport_error() {
        assert!(matches!(
            HeuristicOrderer.send("prompt", "").await,
            Err(ModelError::Transport(_))
        ));
    }
}
