use std::{
    collections::HashMap,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use dynomite::{
    dynamodb::{
        AttributeValue, Delete, DeleteItemError, DeleteItemInput, DynamoDb, DynamoDbClient, Put,
        TransactWriteItem, TransactWriteItemsError, TransactWriteItemsInput, Update,
    },
    Attribute, Attributes, Item,
};
use futures::future::join_all;
use rusoto_core::{Region, RusotoError};

use super::LockStore;
use crate::{
    error::StoreError,
    lease::{LockToken, ResourceKeys},
};

/// DynamoDB caps the number of actions in one transaction.
pub const MAX_KEYS_PER_REQUEST: usize = 25;

const ACQUIRE_CONDITION: &str = "attribute_not_exists(lock_key) OR expires_at <= :now";
const EXTEND_CONDITION: &str = "lock_token = :token AND expires_at > :now";
const RELEASE_CONDITION: &str = "lock_token = :token";

#[derive(Item, Debug, Clone, PartialEq)]
pub(crate) struct LockRecord {
    #[dynomite(partition_key)]
    pub(crate) lock_key: String,
    pub(crate) lock_token: String,
    pub(crate) expires_at: u64,
}

/// Lease store backed by one DynamoDB table, one item per resource key.
///
/// Acquire and extend are a single `TransactWriteItems` call whose condition
/// expressions make the whole key set succeed or fail together. Release deletes
/// every key still carrying the token and skips the rest: it tries one
/// transaction first, and if any key has changed hands it falls back to one
/// conditional delete per key.
pub struct DynamoLockStore {
    name: String,
    table: String,
    dynamo_client: DynamoDbClient,
}

impl DynamoLockStore {
    pub fn new(name: impl Into<String>, table: impl Into<String>, region: Region) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            dynamo_client: DynamoDbClient::new(region),
        }
    }

    fn check_size(&self, keys: &ResourceKeys) -> Result<(), StoreError> {
        if keys.len() > MAX_KEYS_PER_REQUEST {
            return Err(StoreError::TooManyKeys {
                count: keys.len(),
                limit: MAX_KEYS_PER_REQUEST,
            });
        }
        Ok(())
    }

    fn out_of_range(&self, ttl: Duration) -> StoreError {
        StoreError::TtlOutOfRange {
            store: self.name.clone(),
            ttl,
        }
    }

    fn backend<E: std::error::Error + 'static>(&self, err: RusotoError<E>) -> StoreError {
        StoreError::Backend {
            store: self.name.clone(),
            message: err.to_string(),
        }
    }

    async fn transact(&self, items: Vec<TransactWriteItem>) -> Result<bool, StoreError> {
        let input = TransactWriteItemsInput {
            transact_items: items,
            ..TransactWriteItemsInput::default()
        };
        match self.dynamo_client.transact_write_items(input).await {
            Ok(_) => Ok(true),
            // A failed condition on any key cancels the whole transaction
            Err(RusotoError::Service(TransactWriteItemsError::TransactionCanceled(_))) => Ok(false),
            Err(err) => Err(self.backend(err)),
        }
    }

    async fn delete_one(&self, key: &str, token: &LockToken) -> Result<bool, StoreError> {
        match self
            .dynamo_client
            .delete_item(release_key_input(&self.table, key, token))
            .await
        {
            Ok(_) => Ok(true),
            Err(RusotoError::Service(DeleteItemError::ConditionalCheckFailed(_))) => Ok(false),
            Err(err) => Err(self.backend(err)),
        }
    }
}

fn epoch_millis(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn key_of(key: &str) -> Attributes {
    let mut attrs = HashMap::new();
    attrs.insert("lock_key".to_string(), key.to_string().into_attr());
    attrs
}

fn expiry_millis(now: SystemTime, ttl: Duration) -> Option<u64> {
    now.checked_add(ttl).map(epoch_millis)
}

fn values(pairs: Vec<(&str, AttributeValue)>) -> Option<HashMap<String, AttributeValue>> {
    Some(
        pairs
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect(),
    )
}

pub(crate) fn acquire_items(
    table: &str,
    keys: &ResourceKeys,
    token: &LockToken,
    ttl: Duration,
    now: SystemTime,
) -> Option<Vec<TransactWriteItem>> {
    let now_ms = epoch_millis(now);
    let expires_at = expiry_millis(now, ttl)?;
    let items = keys
        .iter()
        .map(|key| TransactWriteItem {
            put: Some(Put {
                table_name: table.to_string(),
                item: LockRecord {
                    lock_key: key.to_string(),
                    lock_token: token.as_str().to_string(),
                    expires_at,
                }
                .into(),
                condition_expression: Some(ACQUIRE_CONDITION.to_string()),
                expression_attribute_values: values(vec![(":now", now_ms.into_attr())]),
                ..Put::default()
            }),
            ..TransactWriteItem::default()
        })
        .collect();
    Some(items)
}

pub(crate) fn extend_items(
    table: &str,
    keys: &ResourceKeys,
    token: &LockToken,
    ttl: Duration,
    now: SystemTime,
) -> Option<Vec<TransactWriteItem>> {
    let now_ms = epoch_millis(now);
    let expires_at = expiry_millis(now, ttl)?;
    let items = keys
        .iter()
        .map(|key| TransactWriteItem {
            update: Some(Update {
                table_name: table.to_string(),
                key: key_of(key),
                update_expression: "SET expires_at = :expires_at".to_string(),
                condition_expression: Some(EXTEND_CONDITION.to_string()),
                expression_attribute_values: values(vec![
                    (":expires_at", expires_at.into_attr()),
                    (":token", token.as_str().to_string().into_attr()),
                    (":now", now_ms.into_attr()),
                ]),
                ..Update::default()
            }),
            ..TransactWriteItem::default()
        })
        .collect();
    Some(items)
}

pub(crate) fn release_items(
    table: &str,
    keys: &ResourceKeys,
    token: &LockToken,
) -> Vec<TransactWriteItem> {
    keys.iter()
        .map(|key| TransactWriteItem {
            delete: Some(Delete {
                table_name: table.to_string(),
                key: key_of(key),
                condition_expression: Some(RELEASE_CONDITION.to_string()),
                expression_attribute_values: values(vec![(
                    ":token",
                    token.as_str().to_string().into_attr(),
                )]),
                ..Delete::default()
            }),
            ..TransactWriteItem::default()
        })
        .collect()
}

pub(crate) fn release_key_input(table: &str, key: &str, token: &LockToken) -> DeleteItemInput {
    DeleteItemInput {
        table_name: table.to_string(),
        key: key_of(key),
        condition_expression: Some(RELEASE_CONDITION.to_string()),
        expression_attribute_values: values(vec![(":token", token.as_str().to_string().into_attr())]),
        ..DeleteItemInput::default()
    }
}

#[async_trait]
impl LockStore for DynamoLockStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn try_acquire(
        &self,
        keys: &ResourceKeys,
        token: &LockToken,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.check_size(keys)?;
        let items = acquire_items(&self.table, keys, token, ttl, SystemTime::now())
            .ok_or_else(|| self.out_of_range(ttl))?;
        self.transact(items).await
    }

    async fn try_extend(
        &self,
        keys: &ResourceKeys,
        token: &LockToken,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.check_size(keys)?;
        let items = extend_items(&self.table, keys, token, ttl, SystemTime::now())
            .ok_or_else(|| self.out_of_range(ttl))?;
        self.transact(items).await
    }

    async fn try_release(
        &self,
        keys: &ResourceKeys,
        token: &LockToken,
    ) -> Result<bool, StoreError> {
        self.check_size(keys)?;
        if self.transact(release_items(&self.table, keys, token)).await? {
            return Ok(true);
        }

        // Some key is absent or owned by someone else; delete the ones still ours
        let outcomes = join_all(keys.iter().map(|key| self.delete_one(key, token))).await;
        let mut first_error = None;
        let mut released = false;
        for outcome in outcomes {
            match outcome {
                Ok(deleted) => released |= deleted,
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) if !released => Err(err),
            _ => Ok(released),
        }
    }
}
