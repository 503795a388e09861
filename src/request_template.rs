use once_cell::sync::Lazy;
use serde_json::{json, Value};

use crate::models::ItemStatus;

/// The large, mostly-constant search request body, built once and cloned per
/// call. Only the fields `build_request_body` mutates vary per call;
/// everything else is fixed upstream-contract data.
static TEMPLATE: Lazy<Value> = Lazy::new(build_template);

fn build_template() -> Value {
    json!({
        "userId": "",
        "config": {
            "responseToggles": {
                "useDynamicAttribute": true,
                "useSuggestedItemCondition": true,
            }
        },
        "pageSize": 120,
        "pageToken": "",
        "searchSessionId": "",
        "source": "BaseSerp",
        "searchCondition": {
            "keyword": "",
            "excludeKeyword": "",
            "sort": "SORT_CREATED_TIME",
            "order": "ORDER_DESC",
            "status": [],
            "sizeId": [],
            "categoryId": [],
            "brandId": [],
            "sellerId": [],
            "priceMin": 0,
            "priceMax": 0,
            "itemConditionId": [],
            "shippingPayerId": [],
            "shippingFromArea": [],
            "shippingMethod": [],
            "colorId": [],
            "hasCoupon": false,
            "attributes": [],
            "itemTypes": [],
            "skuIds": [],
        },
        "serviceFrom": "suruga",
        "withItemBrand": true,
        "withItemSize": false,
        "withItemPromotions": true,
        "withItemSizes": false,
        "withShopname": false,
        "withInitialItems": false,
        "useDynamicAttribute": true,
        "withSuggestedItemCondition": true,
        "withOfferPricePromotion": false,
        "withProductSuggest": true,
        "withParentProducts": false,
        "withMasterId": false,
        "withUserId": false,
        "laplaceDeviceUuid": "",
    })
}

pub const ITEMS_PER_PAGE: u32 = 120;

/// Returns a fresh deep copy of the template with the per-call fields
/// substituted. Concurrent callers never observe each other's edits.
pub fn build_request_body(
    keyword: &str,
    status: ItemStatus,
    search_session_id: &str,
    laplace_device_uuid: &str,
    page_token: &str,
    page_size: u32,
) -> Value {
    let mut body = TEMPLATE.clone();
    body["searchSessionId"] = json!(search_session_id);
    body["laplaceDeviceUuid"] = json!(laplace_device_uuid);
    body["pageToken"] = json!(page_token);
    body["pageSize"] = json!(page_size);
    body["searchCondition"]["keyword"] = json!(keyword);
    body["searchCondition"]["status"] = json!([status.as_search_condition()]);
    body
}
