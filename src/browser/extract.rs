use std::collections::HashMap;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use scraper::{Html, Selector};
use serde_json::{Map, Value};
use url::Url;

use super::DataExtractor;

/// CSS selector extraction over page HTML.
///
/// A selector may end in `@attr` to take an attribute instead of the text,
/// e.g. `a.next@href`. One match yields a string, several an array, none null.
#[derive(Debug, Default)]
pub struct HtmlExtractor;

impl HtmlExtractor {
    pub fn new() -> Self {
        Self
    }

    fn extract_one(document: &Html, target: &str) -> Result<Value> {
        let (css, attr) = match target.rsplit_once('@') {
            Some((css, attr)) if !attr.is_empty() && !attr.contains([' ', ']']) => (css, Some(attr)),
            _ => (target, None),
        };
        let selector =
            Selector::parse(css).map_err(|e| anyhow!("Invalid selector '{}': {:?}", css, e))?;

        let mut values: Vec<Value> = document
            .select(&selector)
            .filter_map(|element| match attr {
                Some(attr) => element.value().attr(attr).map(str::to_string),
                None => {
                    let text = element.text().collect::<Vec<_>>().join(" ");
                    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
                    Some(text)
                }
            })
            .map(Value::String)
            .collect();

        Ok(match values.len() {
            0 => Value::Null,
            1 => values.remove(0),
            _ => Value::Array(values),
        })
    }
}

/// Absolute URLs of every link on the page, resolved against `base`.
pub fn extract_links(html: &str, base: &str) -> Vec<String> {
    let Ok(base) = Url::parse(base) else {
        return Vec::new();
    };
    let document = Html::parse_document(html);
    let Ok(selector) = Selector::parse("a[href]") else {
        return Vec::new();
    };

    let mut links: Vec<String> = document
        .select(&selector)
        .filter_map(|a| a.value().attr("href"))
        .filter_map(|href| base.join(href).ok())
        .filter(|url| matches!(url.scheme(), "http" | "https"))
        .map(|url| url.to_string())
        .collect();
    links.sort();
    links.dedup();
    links
}

#[async_trait]
impl DataExtractor for HtmlExtractor {
    async fn extract(&self, html: &str, selectors: &HashMap<String, String>) -> Result<Value> {
        let document = Html::parse_document(html);
        let mut data = Map::new();
        for (name, target) in selectors {
            data.insert(name.clone(), Self::extract_one(&document, target)?);
        }
        Ok(Value::Object(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const PAGE: &str = r#"
        <html><head><title>Shop</title></head><body>
          <h1>  Blue   Widget </h1>
          <span class="price">$10</span>
          <ul><li>one</li><li>two</li></ul>
          <a href="/next?page=2" class="next">Next</a>
          <a href="https://other.example/x">Other</a>
          <a href="mailto:me@example.com">Mail</a>
        </body></html>
    "#;

    #[tokio::test]
    async fn test_extracts_text_lists_and_attributes() {
        let selectors = HashMap::from([
            ("title".to_string(), "h1".to_string()),
            ("items".to_string(), "li".to_string()),
            ("next".to_string(), "a.next@href".to_string()),
            ("missing".to_string(), ".nope".to_string()),
        ]);
        let data = HtmlExtractor::new().extract(PAGE, &selectors).await.unwrap();
        assert_eq!(data["title"], json!("Blue Widget"));
        assert_eq!(data["items"], json!(["one", "two"]));
        assert_eq!(data["next"], json!("/next?page=2"));
        assert_eq!(data["missing"], Value::Null);
    }

    #[tokio::test]
    async fn test_invalid_selector_is_an_error() {
        let selectors = HashMap::from([("bad".to_string(), "[[".to_string())]);
        assert!(HtmlExtractor::new().extract(PAGE, &selectors).await.is_err());
    }

    #[test]
    fn test_links_are_resolved_and_filtered() {
        let links = extract_links(PAGE, "https://shop.example/products/1");
        assert_eq!(
            links,
            vec![
                "https://other.example/x".to_string(),
                "https://shop.example/next?page=2".to_string(),
            ]
        );
    }
}
