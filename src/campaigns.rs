//! Sample provider: email campaigns and automation workflows.
//!
//! Exposes five tools, one resource, and one prompt on a [`Registry`]:
//!
//! | Kind     | Name                  | Effect                                   |
//! |----------|-----------------------|------------------------------------------|
//! | tool     | `list_campaigns`      | Lists campaigns with status and sends    |
//! | tool     | `create_campaign`     | Creates a draft campaign for a list      |
//! | tool     | `send_campaign`       | Sends a draft campaign                   |
//! | tool     | `list_automations`    | Lists automation workflows               |
//! | tool     | `start_automation`    | Starts every email in a workflow         |
//! | resource | `campaigns://all`     | JSON snapshot of all campaigns           |
//! | prompt   | `draft_campaign`      | Asks for subject and body for a topic    |
//!
//! The backend is reached through [`CampaignService`]. [`CampaignStore`] is
//! an in-memory implementation; it can require a credential, which is
//! compared to the one attached to the calling session.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::info;

use crate::mcp::registry::{
    prompt_fn, resource_fn, tool_fn, HandlerContext, HandlerError, Registry, RegistryError,
};
use crate::mcp::session::Credential;
use crate::mcp::types::{
    GetPromptResult, PromptArgument, PromptDefinition, PromptMessage, PromptRole,
    ResourceContents, ResourceDefinition, ToolCallResult, ToolContent, ToolDefinition,
};

/// URI of the campaign snapshot resource.
pub const CAMPAIGNS_URI: &str = "campaigns://all";

/// Campaign delivery state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    /// Saved, not yet sent.
    Save,
    Sent,
}

/// One email campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    pub name: String,
    pub status: CampaignStatus,
    pub emails_sent: u64,
    pub list_id: String,
    pub from_name: String,
    pub reply_to: String,
}

/// Input of `create_campaign`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCampaign {
    pub list_id: String,
    pub subject: String,
    pub from_name: String,
    pub reply_to: String,
}

/// Automation workflow state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutomationStatus {
    Paused,
    Sending,
}

/// One automation workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Automation {
    pub id: String,
    pub name: String,
    pub status: AutomationStatus,
    pub emails_sent: u64,
}

/// Errors reported by a campaign backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CampaignError {
    /// The session's credential was missing or not accepted.
    #[error("credential rejected by the campaign service")]
    Unauthorized,

    #[error("campaign {0} not found")]
    CampaignNotFound(String),

    #[error("campaign {0} has already been sent")]
    AlreadySent(String),

    #[error("automation workflow {0} not found")]
    AutomationNotFound(String),
}

impl CampaignError {
    const fn reason(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::CampaignNotFound(_) => "campaign_not_found",
            Self::AlreadySent(_) => "already_sent",
            Self::AutomationNotFound(_) => "automation_not_found",
        }
    }
}

impl From<CampaignError> for HandlerError {
    fn from(error: CampaignError) -> Self {
        Self::new(error.to_string()).with_data(json!({ "reason": error.reason() }))
    }
}

/// Backend the campaign tools call.
#[async_trait]
pub trait CampaignService: Send + Sync {
    async fn list_campaigns(&self, credential: Option<&Credential>) -> Result<Vec<Campaign>, CampaignError>;

    async fn create_campaign(
        &self,
        credential: Option<&Credential>,
        campaign: NewCampaign,
    ) -> Result<Campaign, CampaignError>;

    async fn send_campaign(
        &self,
        credential: Option<&Credential>,
        campaign_id: &str,
    ) -> Result<Campaign, CampaignError>;

    async fn list_automations(&self, credential: Option<&Credential>) -> Result<Vec<Automation>, CampaignError>;

    async fn start_automation(
        &self,
        credential: Option<&Credential>,
        workflow_id: &str,
    ) -> Result<Automation, CampaignError>;
}

#[derive(Debug, Default)]
struct StoreState {
    campaigns: IndexMap<String, Campaign>,
    automations: IndexMap<String, Automation>,
    next_id: u64,
}

impl StoreState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}{:04}", self.next_id)
    }
}

/// In-memory [`CampaignService`].
#[derive(Debug, Default)]
pub struct CampaignStore {
    required: Option<Credential>,
    state: Mutex<StoreState>,
}

impl CampaignStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects calls whose session credential differs from `credential`.
    #[must_use]
    pub fn with_required_credential(mut self, credential: Credential) -> Self {
        self.required = Some(credential);
        self
    }

    /// Adds a paused automation workflow and returns its ID.
    pub fn add_automation(&self, name: &str) -> String {
        let mut state = self.state();
        let id = state.next_id("wf");
        state.automations.insert(
            id.clone(),
            Automation {
                id: id.clone(),
                name: name.to_string(),
                status: AutomationStatus::Paused,
                emails_sent: 0,
            },
        );
        id
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn authorize(&self, credential: Option<&Credential>) -> Result<(), CampaignError> {
        match &self.required {
            None => Ok(()),
            Some(required) if credential == Some(required) => Ok(()),
            Some(_) => Err(CampaignError::Unauthorized),
        }
    }
}

#[async_trait]
impl CampaignService for CampaignStore {
    async fn list_campaigns(&self, credential: Option<&Credential>) -> Result<Vec<Campaign>, CampaignError> {
        self.authorize(credential)?;
        Ok(self.state().campaigns.values().cloned().collect())
    }

    async fn create_campaign(
        &self,
        credential: Option<&Credential>,
        campaign: NewCampaign,
    ) -> Result<Campaign, CampaignError> {
        self.authorize(credential)?;
        let mut state = self.state();
        let id = state.next_id("cmp");
        let created = Campaign {
            id: id.clone(),
            name: campaign.subject,
            status: CampaignStatus::Save,
            emails_sent: 0,
            list_id: campaign.list_id,
            from_name: campaign.from_name,
            reply_to: campaign.reply_to,
        };
        state.campaigns.insert(id, created.clone());
        Ok(created)
    }

    async fn send_campaign(
        &self,
        credential: Option<&Credential>,
        campaign_id: &str,
    ) -> Result<Campaign, CampaignError> {
        self.authorize(credential)?;
        let mut state = self.state();
        let campaign = state
            .campaigns
            .get_mut(campaign_id)
            .ok_or_else(|| CampaignError::CampaignNotFound(campaign_id.to_string()))?;
        if campaign.status == CampaignStatus::Sent {
            return Err(CampaignError::AlreadySent(campaign_id.to_string()));
        }
        campaign.status = CampaignStatus::Sent;
        campaign.emails_sent += 1;
        Ok(campaign.clone())
    }

    async fn list_automations(&self, credential: Option<&Credential>) -> Result<Vec<Automation>, CampaignError> {
        self.authorize(credential)?;
        Ok(self.state().automations.values().cloned().collect())
    }

    async fn start_automation(
        &self,
        credential: Option<&Credential>,
        workflow_id: &str,
    ) -> Result<Automation, CampaignError> {
        self.authorize(credential)?;
        let mut state = self.state();
        let workflow = state
            .automations
            .get_mut(workflow_id)
            .ok_or_else(|| CampaignError::AutomationNotFound(workflow_id.to_string()))?;
        workflow.status = AutomationStatus::Sending;
        Ok(workflow.clone())
    }
}

fn no_arguments() -> Value {
    json!({
        "type": "object",
        "properties": {},
        "additionalProperties": false
    })
}

fn id_argument(name: &str, description: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            name: {"type": "string", "minLength": 1, "description": description}
        },
        "required": [name],
        "additionalProperties": false
    })
}

fn create_campaign_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "list_id": {"type": "string", "minLength": 1, "description": "Audience list the campaign is sent to"},
            "subject": {"type": "string", "minLength": 1, "maxLength": 150, "description": "Subject line"},
            "from_name": {"type": "string", "minLength": 1, "description": "Sender name"},
            "reply_to": {"type": "string", "minLength": 3, "pattern": "^[^@\\s]+@[^@\\s]+$", "description": "Reply-to address"}
        },
        "required": ["list_id", "subject", "from_name", "reply_to"],
        "additionalProperties": false
    })
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, HandlerError> {
    Ok(serde_json::to_value(value)?)
}

fn string_argument(arguments: &Value, name: &str) -> Result<String, HandlerError> {
    arguments
        .get(name)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| HandlerError::invalid_params(format!("Missing argument: {name}")))
}

/// Registers the campaign tools, resource, and prompt.
///
/// # Errors
///
/// Fails if any of the names is already registered.
pub fn register(registry: &Registry, service: Arc<dyn CampaignService>) -> Result<(), RegistryError> {
    let svc = Arc::clone(&service);
    registry.register_tool(
        ToolDefinition::new(
            "list_campaigns",
            "Retrieve all email campaigns with their status and send counts",
            no_arguments(),
        ),
        tool_fn(move |ctx: HandlerContext, _args| {
            let svc = Arc::clone(&svc);
            async move {
                let campaigns = svc.list_campaigns(ctx.credential()).await?;
                Ok(ToolCallResult::json(to_json(&campaigns)?))
            }
        }),
    )?;

    let svc = Arc::clone(&service);
    registry.register_tool(
        ToolDefinition::new(
            "create_campaign",
            "Create a new email campaign for an audience list; returns its ID and status",
            create_campaign_schema(),
        ),
        tool_fn(move |ctx: HandlerContext, args| {
            let svc = Arc::clone(&svc);
            async move {
                let campaign: NewCampaign = serde_json::from_value(args)?;
                let created = svc.create_campaign(ctx.credential(), campaign).await?;
                info!(campaign = %created.id, "Campaign created");
                Ok(ToolCallResult::json(json!({
                    "id": created.id,
                    "status": created.status,
                })))
            }
        }),
    )?;

    let svc = Arc::clone(&service);
    registry.register_tool(
        ToolDefinition::new(
            "send_campaign",
            "Send a campaign that has been created and is ready to send",
            id_argument("campaign_id", "ID returned by create_campaign"),
        ),
        tool_fn(move |ctx: HandlerContext, args| {
            let svc = Arc::clone(&svc);
            async move {
                let id = string_argument(&args, "campaign_id")?;
                ctx.report_progress(0.0, Some(1.0), Some("sending"));
                let sent = svc.send_campaign(ctx.credential(), &id).await?;
                ctx.report_progress(1.0, Some(1.0), Some("sent"));
                Ok(ToolCallResult::text(format!("Campaign {} has been sent.", sent.id)))
            }
        }),
    )?;

    let svc = Arc::clone(&service);
    registry.register_tool(
        ToolDefinition::new(
            "list_automations",
            "List all automation workflows",
            no_arguments(),
        ),
        tool_fn(move |ctx: HandlerContext, _args| {
            let svc = Arc::clone(&svc);
            async move {
                let automations = svc.list_automations(ctx.credential()).await?;
                Ok(ToolCallResult::json(to_json(&automations)?))
            }
        }),
    )?;

    let svc = Arc::clone(&service);
    registry.register_tool(
        ToolDefinition::new(
            "start_automation",
            "Start all emails in an automation workflow",
            id_argument("workflow_id", "Automation workflow ID"),
        ),
        tool_fn(move |ctx: HandlerContext, args| {
            let svc = Arc::clone(&svc);
            async move {
                let id = string_argument(&args, "workflow_id")?;
                let workflow = svc.start_automation(ctx.credential(), &id).await?;
                Ok(ToolCallResult::text(format!(
                    "Automation workflow {} started.",
                    workflow.id
                )))
            }
        }),
    )?;

    let svc = Arc::clone(&service);
    registry.register_resource(
        ResourceDefinition {
            uri: CAMPAIGNS_URI.to_string(),
            name: "All campaigns".to_string(),
            description: Some("Every campaign in the account, as JSON".to_string()),
            mime_type: Some("application/json".to_string()),
        },
        resource_fn(move |ctx: HandlerContext, uri| {
            let svc = Arc::clone(&svc);
            async move {
                let campaigns = svc.list_campaigns(ctx.credential()).await?;
                let text = serde_json::to_string_pretty(&campaigns)?;
                Ok(vec![ResourceContents::text(uri, Some("application/json"), text)])
            }
        }),
    )?;

    registry.register_prompt(
        PromptDefinition {
            name: "draft_campaign".to_string(),
            description: Some("Draft the subject line and body of a campaign".to_string()),
            arguments: vec![
                PromptArgument::required("topic", "What the campaign is about"),
                PromptArgument::optional("audience", "Who the campaign is for"),
            ],
        },
        prompt_fn(|_ctx, arguments: BTreeMap<String, String>| async move {
            let topic = arguments.get("topic").map_or("", String::as_str);
            let audience = arguments
                .get("audience")
                .map_or_else(|| "all subscribers".to_string(), Clone::clone);
            Ok(GetPromptResult {
                description: Some(format!("Campaign draft about {topic}")),
                messages: vec![PromptMessage {
                    role: PromptRole::User,
                    content: ToolContent::text(format!(
                        "Write an email campaign about {topic} for {audience}. \
                         Give a subject line under 150 characters, then the body."
                    )),
                }],
            })
        }),
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::protocol::ErrorCode;

    fn registry(store: CampaignStore) -> Registry {
        let registry = Registry::new();
        register(&registry, Arc::new(store)).unwrap();
        registry
    }

    fn ctx(credential: Option<&str>) -> HandlerContext {
        HandlerContext::new("test-session", credential.map(Credential::new))
    }

    fn valid_campaign() -> Value {
        json!({
            "list_id": "list-1",
            "subject": "Spring sale",
            "from_name": "Shop",
            "reply_to": "hello@shop.example"
        })
    }

    #[test]
    fn registers_everything_in_order() {
        let registry = registry(CampaignStore::new());
        let names: Vec<_> = registry.list_tools().into_iter().map(|t| t.name).collect();
        assert_eq!(
            names,
            [
                "list_campaigns",
                "create_campaign",
                "send_campaign",
                "list_automations",
                "start_automation"
            ]
        );
        assert_eq!(registry.list_resources()[0].uri, CAMPAIGNS_URI);
        assert!(registry.describe_prompt("draft_campaign").is_some());
    }

    #[test]
    fn list_campaigns_takes_no_parameters() {
        let registry = registry(CampaignStore::new());
        let tool = registry.describe_tool("list_campaigns").unwrap();
        assert_eq!(tool.input_schema["properties"], json!({}));
        assert!(tool.input_schema.get("required").is_none());
    }

    #[tokio::test]
    async fn create_then_send() {
        let registry = registry(CampaignStore::new());

        let created = registry
            .call_tool(ctx(None), "create_campaign", valid_campaign())
            .await
            .unwrap();
        let id = created.structured_content.unwrap()["id"]
            .as_str()
            .unwrap()
            .to_string();

        let sent = registry
            .call_tool(ctx(None), "send_campaign", json!({"campaign_id": id}))
            .await
            .unwrap();
        assert!(sent.joined_text().contains("has been sent"));

        let again = registry
            .call_tool(ctx(None), "send_campaign", json!({"campaign_id": id}))
            .await
            .unwrap_err();
        assert_eq!(again.code, ErrorCode::InternalError.code());
        assert_eq!(again.data.unwrap()["reason"], "already_sent");
    }

    #[tokio::test]
    async fn empty_subject_is_rejected_before_the_handler() {
        let store = Arc::new(CampaignStore::new());
        let registry = Registry::new();
        register(&registry, Arc::clone(&store) as Arc<dyn CampaignService>).unwrap();

        let mut args = valid_campaign();
        args["subject"] = json!("");
        let err = registry
            .call_tool(ctx(None), "create_campaign", args)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidParams.code());
        assert!(store.list_campaigns(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn bad_reply_to_is_rejected() {
        let registry = registry(CampaignStore::new());
        let mut args = valid_campaign();
        args["reply_to"] = json!("not an address");
        let err = registry
            .call_tool(ctx(None), "create_campaign", args)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidParams.code());
    }

    #[tokio::test]
    async fn credential_is_checked_by_the_store() {
        let registry = registry(CampaignStore::new().with_required_credential(Credential::new("secret")));

        let err = registry
            .call_tool(ctx(Some("wrong")), "list_campaigns", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.data.unwrap()["reason"], "unauthorized");
        assert!(!err.message.contains("secret"));

        assert!(registry
            .call_tool(ctx(Some("secret")), "list_campaigns", json!({}))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn automations_start() {
        let store = CampaignStore::new();
        let workflow = store.add_automation("Welcome series");
        let registry = registry(store);

        let result = registry
            .call_tool(ctx(None), "start_automation", json!({"workflow_id": workflow}))
            .await
            .unwrap();
        assert!(result.joined_text().contains("started"));

        let listed = registry
            .call_tool(ctx(None), "list_automations", json!({}))
            .await
            .unwrap();
        assert_eq!(listed.structured_content.unwrap()[0]["status"], "sending");

        let missing = registry
            .call_tool(ctx(None), "start_automation", json!({"workflow_id": "wf9999"}))
            .await
            .unwrap_err();
        assert_eq!(missing.data.unwrap()["reason"], "automation_not_found");
    }

    #[tokio::test]
    async fn resource_and_prompt() {
        let registry = registry(CampaignStore::new());
        registry
            .call_tool(ctx(None), "create_campaign", valid_campaign())
            .await
            .unwrap();

        let contents = registry.read_resource(ctx(None), CAMPAIGNS_URI).await.unwrap();
        let ResourceContents::Text { text, .. } = &contents[0] else {
            panic!("expected text contents");
        };
        assert!(text.contains("Spring sale"));

        let prompt = registry
            .get_prompt(
                ctx(None),
                "draft_campaign",
                BTreeMap::from([("topic".to_string(), "gardening".to_string())]),
            )
            .await
            .unwrap();
        let ToolContent::Text { text } = &prompt.messages[0].content else {
            panic!("expected text content");
        };
        assert!(text.contains("gardening"));
        assert!(text.contains("all subscribers"));

        let missing = registry
            .get_prompt(ctx(None), "draft_campaign", BTreeMap::new())
            .await
            .unwrap_err();
        assert_eq!(missing.code, ErrorCode::InvalidParams.code());
    }
}
