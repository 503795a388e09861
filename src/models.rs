use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// On-sale vs sold, mirrored onto the wire as the integer values the upstream
/// proto-JSON contract uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ItemStatus {
    OnSale = 0,
    Sold = 1,
}

impl ItemStatus {
    pub fn as_search_condition(&self) -> &'static str {
        match self {
            ItemStatus::OnSale => "STATUS_ON_SALE",
            ItemStatus::Sold => "STATUS_SOLD_OUT",
        }
    }
}

// A plain `#[derive(Serialize, Deserialize)]` would encode the variant name
// ("OnSale"/"Sold") instead of the proto-style integer the upstream
// Go/protobuf consumer expects on `…:queue:results`; `#[repr(u8)]` has no
// effect on serde, so this is written out by hand.
impl Serialize for ItemStatus {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for ItemStatus {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        match u8::deserialize(d)? {
            0 => Ok(ItemStatus::OnSale),
            1 => Ok(ItemStatus::Sold),
            other => Err(D::Error::custom(format!("invalid ItemStatus value: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub source_id: String,
    pub title: String,
    pub price: u32,
    pub image_url: String,
    pub item_url: String,
    pub status: ItemStatus,
}

fn is_empty_vec<T>(v: &[T]) -> bool {
    v.is_empty()
}

fn is_empty_str(s: &str) -> bool {
    s.is_empty()
}

/// A unit of work popped from `<ns>:queue:tasks`.
///
/// `ip_id` and `created_at` round-trip through JSON as strings, matching the
/// protobuf-JSON convention the producer side uses for 64-bit integers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlRequest {
    #[serde(with = "stringified_u64")]
    pub ip_id: u64,
    pub keyword: String,
    pub task_id: String,
    #[serde(with = "stringified_i64")]
    pub created_at: i64,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_pages")]
    pub pages_on_sale: u32,
    #[serde(default = "default_pages")]
    pub pages_sold: u32,
}

fn default_pages() -> u32 {
    5
}

/// A unit of work pushed to `<ns>:queue:results`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlResponse {
    #[serde(with = "stringified_u64")]
    pub ip_id: u64,
    pub task_id: String,
    #[serde(with = "stringified_i64")]
    pub crawled_at: i64,
    #[serde(default, skip_serializing_if = "is_empty_vec")]
    pub items: Vec<Item>,
    #[serde(default)]
    pub total_found: u32,
    #[serde(default, skip_serializing_if = "is_empty_str")]
    pub error_message: String,
    #[serde(default)]
    pub pages_crawled: u32,
    #[serde(default)]
    pub retry_count: u32,
}

impl CrawlResponse {
    pub fn is_success(&self) -> bool {
        self.error_message.is_empty()
    }
}

/// Internal result of a single `search` call; not part of the wire contract.
#[derive(Debug, Clone, Default)]
pub struct SearchResult {
    pub items: Vec<Item>,
    pub total_count: u32,
    pub has_next: bool,
    pub next_page_token: String,
}

mod stringified_u64 {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse::<u64>().map_err(D::Error::custom)
    }
}

mod stringified_i64 {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &i64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse::<i64>().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crawl_request_round_trips_and_defaults() {
        let json = r#"{"ipId":"42","keyword":"hololive","taskId":"abc-1","createdAt":"1000"}"#;
        let req: CrawlRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.ip_id, 42);
        assert_eq!(req.created_at, 1000);
        assert_eq!(req.retry_count, 0);
        assert_eq!(req.pages_on_sale, 5);
        assert_eq!(req.pages_sold, 5);
    }

    #[test]
    fn crawl_response_omits_empty_items_and_error() {
        let resp = CrawlResponse {
            ip_id: 1,
            task_id: "t1".into(),
            crawled_at: 10,
            items: vec![],
            total_found: 0,
            error_message: String::new(),
            pages_crawled: 0,
            retry_count: 0,
        };
        let encoded = serde_json::to_string(&resp).unwrap();
        assert!(!encoded.contains("\"items\""));
        assert!(!encoded.contains("\"errorMessage\""));
        assert!(encoded.contains("\"ipId\":\"1\""));
        assert!(encoded.contains("\"totalFound\":0"));
        assert!(encoded.contains("\"pagesCrawled\":0"));
        assert!(encoded.contains("\"retryCount\":0"));
    }

    #[test]
    fn item_status_serializes_as_proto_integer() {
        assert_eq!(serde_json::to_string(&ItemStatus::OnSale).unwrap(), "0");
        assert_eq!(serde_json::to_string(&ItemStatus::Sold).unwrap(), "1");
        assert_eq!(
            serde_json::from_str::<ItemStatus>("0").unwrap(),
            ItemStatus::OnSale
        );
        assert_eq!(
            serde_json::from_str::<ItemStatus>("1").unwrap(),
            ItemStatus::Sold
        );
        assert!(serde_json::from_str::<ItemStatus>("2").is_err());
    }

    #[test]
    fn crawl_response_keeps_populated_fields() {
        let resp = CrawlResponse {
            ip_id: 1,
            task_id: "t1".into(),
            crawled_at: 10,
            items: vec![Item {
                source_id: "s1".into(),
                title: "x".into(),
                price: 100,
                image_url: "".into(),
                item_url: "".into(),
                status: ItemStatus::OnSale,
            }],
            total_found: 1,
            error_message: "boom".into(),
            pages_crawled: 1,
            retry_count: 0,
        };
        let encoded = serde_json::to_string(&resp).unwrap();
        assert!(encoded.contains("\"items\""));
        assert!(encoded.contains("\"errorMessage\":\"boom\""));
    }
}
