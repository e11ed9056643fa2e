//! Entitlement Module
//!
//! Answers "what does this user have right now?" from the subscription row
//! and the grants produced by add-on and token-pack purchases.
//!
//! `compute_view()` is the only place that decides whether a stored
//! subscription still entitles the user. A subscription whose `expires_at`
//! has passed reads as `EXPIRED` even before a provider event says so.

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use billsync_shared::{EntitlementGrant, ProductKind, Subscription, SubscriptionStatus};

use crate::error::BillingResult;
use crate::store::Stores;

/// Current entitlement state of one user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionView {
    pub user_id: Uuid,
    /// `NO_SUBSCRIPTION` when the user has no subscription row
    pub status: SubscriptionStatus,
    /// Status as stored, before expiry is applied
    pub stored_status: Option<SubscriptionStatus>,
    pub plan_id: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    pub entitled: bool,
    pub last_event_id: Option<String>,
    pub addons: Vec<String>,
    pub promo_tokens: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub computed_at: OffsetDateTime,
}

/// Pure: same inputs, same view
pub fn compute_view(
    user_id: Uuid,
    subscription: Option<&Subscription>,
    grants: &[EntitlementGrant],
    now: OffsetDateTime,
) -> SubscriptionView {
    let status = match subscription {
        None => SubscriptionStatus::NoSubscription,
        Some(sub) => match sub.expires_at {
            Some(expires_at) if sub.status.is_entitled() && expires_at <= now => {
                SubscriptionStatus::Expired
            }
            _ => sub.status,
        },
    };

    let mut addons: Vec<String> = grants
        .iter()
        .filter(|g| g.kind == ProductKind::AddonMarketplace)
        .filter_map(|g| g.bot_type.clone())
        .collect();
    addons.sort();
    addons.dedup();

    let promo_tokens = grants
        .iter()
        .filter(|g| g.kind == ProductKind::PromoTokenPack)
        .map(|g| i64::from(g.quantity))
        .sum();

    SubscriptionView {
        user_id,
        status,
        stored_status: subscription.map(|s| s.status),
        plan_id: subscription.map(|s| s.plan_id.clone()),
        expires_at: subscription.and_then(|s| s.expires_at),
        entitled: status.is_entitled(),
        last_event_id: subscription.and_then(|s| s.last_event_id.clone()),
        addons,
        promo_tokens,
        computed_at: now,
    }
}

/// Entitlement lookups over the ledger
#[derive(Clone)]
pub struct EntitlementService {
    stores: Stores,
}

impl EntitlementService {
    pub fn new(stores: Stores) -> Self {
        Self { stores }
    }

    pub async fn subscription_view(&self, user_id: Uuid) -> BillingResult<SubscriptionView> {
        let subscription = self.stores.ledger.subscription_for_user(user_id).await?;
        let grants = self.stores.ledger.grants_for_user(user_id).await?;
        Ok(compute_view(
            user_id,
            subscription.as_ref(),
            &grants,
            OffsetDateTime::now_utc(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn subscription(status: SubscriptionStatus, expires_in: Option<Duration>) -> Subscription {
        let now = OffsetDateTime::now_utc();
        Subscription {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            plan_id: "plan-basic".into(),
            status,
            external_customer_id: None,
            expires_at: expires_in.map(|d| now + d),
            last_event_id: Some("tx1".into()),
            created_at: now,
            updated_at: now,
        }
    }

    fn grant(kind: ProductKind, bot_type: Option<&str>, quantity: i32) -> EntitlementGrant {
        EntitlementGrant {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            kind,
            bot_type: bot_type.map(str::to_string),
            quantity,
            source_event_id: Uuid::new_v4().to_string(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn test_no_subscription() {
        let view = compute_view(Uuid::new_v4(), None, &[], OffsetDateTime::now_utc());
        assert_eq!(view.status, SubscriptionStatus::NoSubscription);
        assert!(!view.entitled);
        assert!(view.plan_id.is_none());
    }

    #[test]
    fn test_active_subscription_is_entitled() {
        let sub = subscription(SubscriptionStatus::Active, Some(Duration::days(10)));
        let view = compute_view(sub.user_id, Some(&sub), &[], OffsetDateTime::now_utc());
        assert_eq!(view.status, SubscriptionStatus::Active);
        assert!(view.entitled);
        assert_eq!(view.plan_id.as_deref(), Some("plan-basic"));
    }

    #[test]
    fn test_lapsed_subscription_reads_expired() {
        let sub = subscription(SubscriptionStatus::Active, Some(Duration::days(-1)));
        let view = compute_view(sub.user_id, Some(&sub), &[], OffsetDateTime::now_utc());
        assert_eq!(view.status, SubscriptionStatus::Expired);
        assert_eq!(view.stored_status, Some(SubscriptionStatus::Active));
        assert!(!view.entitled);
    }

    #[test]
    fn test_grants_are_summarized() {
        let grants = vec![
            grant(ProductKind::AddonMarketplace, Some("sales-bot"), 1),
            grant(ProductKind::AddonMarketplace, Some("sales-bot"), 1),
            grant(ProductKind::PromoTokenPack, None, 500),
            grant(ProductKind::PromoTokenPack, None, 250),
        ];
        let view = compute_view(Uuid::new_v4(), None, &grants, OffsetDateTime::now_utc());
        assert_eq!(view.addons, vec!["sales-bot".to_string()]);
        assert_eq!(view.promo_tokens, 750);
    }
}
