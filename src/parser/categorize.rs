//! Action categorization. Repair actions are checked before the generic
//! `GET`/`PUT` substring tests so `GET_REPAIR`/`PUT_REPAIR` never fall
//! through into the plain get/put buckets.

use crate::events::Category;

pub fn categorize_action(action: &str) -> Category {
    if action == "GET_AUDIT" {
        return Category::Audit;
    }
    if action.contains("GET_REPAIR") {
        return Category::GetRepair;
    }
    if action.contains("PUT_REPAIR") {
        return Category::PutRepair;
    }
    if action.contains("GET") {
        return Category::Get;
    }
    if action.contains("PUT") {
        return Category::Put;
    }
    Category::Other
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audit_action() {
        assert_eq!(categorize_action("GET_AUDIT").as_str(), "audit");
    }

    #[test]
    fn repair_actions_are_distinguished() {
        assert_eq!(categorize_action("GET_REPAIR").as_str(), "get_repair");
        assert_eq!(categorize_action("PUT_REPAIR").as_str(), "put_repair");
    }

    #[test]
    fn plain_get_and_put() {
        assert_eq!(categorize_action("GET").as_str(), "get");
        assert_eq!(categorize_action("PUT").as_str(), "put");
    }

    #[test]
    fn unknown_action_is_other() {
        assert_eq!(categorize_action("DELETE").as_str(), "other");
    }
}
