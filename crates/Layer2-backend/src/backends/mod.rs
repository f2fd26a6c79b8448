//! Backend 전략 구현
//!
//! `AuthKind` variant당 하나의 전략:
//! - google: ApiKey / VertexAi
//! - code_assist: OauthPersonal / CloudShell
//! - gateway: Gateway

pub mod code_assist;
pub mod gateway;
pub mod google;

pub use code_assist::{CodeAssistGenerator, MetadataTokenSource, StaticTokenSource, TokenSource};
pub use gateway::GatewayGenerator;
pub use google::GoogleGenerator;
