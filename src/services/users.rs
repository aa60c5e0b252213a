// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use super::ServiceError;
use crate::{events::UserCreatedEvent, publisher::RabbitMQPublisher};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::RwLock;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i32,
    pub name: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUserRequest {
    pub name: String,
    pub email: String,
}

impl CreateUserRequest {
    fn validate(&self) -> Result<(), ServiceError> {
        if self.name.trim().is_empty() {
            return Err(ServiceError::Validation("name is required".to_owned()));
        }
        if !self.email.contains('@') {
            return Err(ServiceError::Validation(format!(
                "`{}` is not an email address",
                self.email
            )));
        }
        Ok(())
    }
}

#[derive(Default)]
struct UserStore {
    next_id: i32,
    users: BTreeMap<i32, User>,
}

pub struct UserService {
    store: RwLock<UserStore>,
    publisher: Arc<RabbitMQPublisher>,
}

impl UserService {
    pub fn new(publisher: Arc<RabbitMQPublisher>) -> Self {
        UserService {
            store: RwLock::new(UserStore::default()),
            publisher,
        }
    }

    pub async fn list(&self) -> Vec<User> {
        self.store.read().await.users.values().cloned().collect()
    }

    pub async fn get(&self, id: i32) -> Result<User, ServiceError> {
        self.store
            .read()
            .await
            .users
            .get(&id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("user {id}")))
    }

    /// Stores the user, then announces it on `user.events`/`user.created`.
    pub async fn create(&self, request: CreateUserRequest) -> Result<User, ServiceError> {
        request.validate()?;

        let user = {
            let mut store = self.store.write().await;
            store.next_id += 1;
            let user = User {
                id: store.next_id,
                name: request.name,
                email: request.email,
                created_at: Utc::now(),
            };
            store.users.insert(user.id, user.clone());
            user
        };

        let event = UserCreatedEvent {
            user_id: user.id,
            name: user.name.clone(),
            email: user.email.clone(),
            created_at: user.created_at,
        };
        self.publisher.publish_event(&event).await?;

        info!(user_id = user.id, "user created");
        Ok(user)
    }

    pub async fn update(&self, id: i32, request: CreateUserRequest) -> Result<User, ServiceError> {
        request.validate()?;

        let mut store = self.store.write().await;
        let user = store
            .users
            .get_mut(&id)
            .ok_or_else(|| ServiceError::NotFound(format!("user {id}")))?;
        user.name = request.name;
        user.email = request.email;

        info!(user_id = id, "user updated");
        Ok(user.clone())
    }

    pub async fn delete(&self, id: i32) -> Result<(), ServiceError> {
        match self.store.write().await.users.remove(&id) {
            Some(_) => {
                info!(user_id = id, "user deleted");
                Ok(())
            }
            None => Err(ServiceError::NotFound(format!("user {id}"))),
        }
    }
}
