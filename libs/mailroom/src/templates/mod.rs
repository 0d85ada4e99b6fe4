//! Email template management with Handlebars
//!
//! Templates declare the variables they require; rendering validates the
//! supplied map against that list before touching Handlebars, so a missing
//! variable never produces partially rendered output. Subject, HTML body and
//! text body render as one atomic unit.

use std::collections::HashMap;

use handlebars::{handlebars_helper, Handlebars};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{DeliveryError, DeliveryResult};

/// Rendered template output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEmail {
    pub subject: String,
    pub body_html: Option<String>,
    pub body_text: Option<String>,
}

/// Email template definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmailTemplate {
    pub id: String,
    pub name: String,
    pub subject: String,
    pub body_html: Option<String>,
    pub body_text: Option<String>,
    /// Variables that must be present in the render map
    #[serde(default)]
    pub variables: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl EmailTemplate {
    pub fn new(id: impl Into<String>, name: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            subject: subject.into(),
            body_html: None,
            body_text: None,
            variables: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Set HTML body
    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        self.body_html = Some(html.into());
        self
    }

    /// Set plain text body
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.body_text = Some(text.into());
        self
    }

    /// Declare required variables
    pub fn with_variables(mut self, variables: &[&str]) -> Self {
        self.variables = variables.iter().map(|v| v.to_string()).collect();
        self
    }

    /// Add a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

handlebars_helper!(upper: |value: str| value.to_uppercase());
handlebars_helper!(lower: |value: str| value.to_lowercase());
handlebars_helper!(trim: |value: str| value.trim().to_string());
handlebars_helper!(title: |value: str| {
    value
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
});
// Substitute a fallback when the value is missing or blank
handlebars_helper!(default_value: |value: Json, fallback: Json| {
    match value {
        Value::Null => fallback.clone(),
        Value::String(s) if s.trim().is_empty() => fallback.clone(),
        other => other.clone(),
    }
});

struct Registry {
    handlebars: Handlebars<'static>,
    templates: HashMap<String, EmailTemplate>,
}

/// Thread-safe template registry and renderer.
///
/// Registration takes the write lock; renders share the read lock, so
/// concurrent renders never block each other.
pub struct TemplateEngine {
    registry: RwLock<Registry>,
}

impl TemplateEngine {
    /// Create an engine with helpers and the built-in templates registered.
    pub fn new() -> DeliveryResult<Self> {
        let mut handlebars = Handlebars::new();
        handlebars.register_helper("upper", Box::new(upper));
        handlebars.register_helper("lower", Box::new(lower));
        handlebars.register_helper("trim", Box::new(trim));
        handlebars.register_helper("title", Box::new(title));
        handlebars.register_helper("default", Box::new(default_value));

        let mut registry = Registry {
            handlebars,
            templates: HashMap::new(),
        };
        for template in builtin_templates() {
            register_into(&mut registry, template)?;
        }
        Ok(Self {
            registry: RwLock::new(registry),
        })
    }

    /// Validate and store a template, overwriting any previous registration
    /// under the same id.
    pub async fn register(&self, template: EmailTemplate) -> DeliveryResult<()> {
        let mut registry = self.registry.write().await;
        register_into(&mut registry, template)
    }

    /// Look up a template by id.
    pub async fn get(&self, id: &str) -> DeliveryResult<EmailTemplate> {
        let registry = self.registry.read().await;
        registry
            .templates
            .get(id)
            .cloned()
            .ok_or_else(|| DeliveryError::TemplateNotFound(id.to_string()))
    }

    /// Ids of all registered templates.
    pub async fn list(&self) -> Vec<String> {
        let registry = self.registry.read().await;
        registry.templates.keys().cloned().collect()
    }

    pub async fn contains(&self, id: &str) -> bool {
        let registry = self.registry.read().await;
        registry.templates.contains_key(id)
    }

    /// Render subject, HTML body and text body as one atomic unit.
    ///
    /// Every declared variable must be present in `variables`; otherwise the
    /// call fails with [`DeliveryError::TemplateMissingVariables`] naming all
    /// missing keys, before anything is rendered.
    pub async fn render(
        &self,
        id: &str,
        variables: &Map<String, Value>,
    ) -> DeliveryResult<RenderedEmail> {
        let registry = self.registry.read().await;
        let template = registry
            .templates
            .get(id)
            .ok_or_else(|| DeliveryError::TemplateNotFound(id.to_string()))?;

        let missing: Vec<String> = template
            .variables
            .iter()
            .filter(|name| !variables.contains_key(*name))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(DeliveryError::TemplateMissingVariables(missing));
        }

        let data = Value::Object(variables.clone());
        let subject = registry
            .handlebars
            .render(&subject_key(id), &data)
            .map_err(|e| DeliveryError::TemplateInvalid(format!("subject: {e}")))?;
        let body_html = if template.body_html.is_some() {
            Some(
                registry
                    .handlebars
                    .render(&html_key(id), &data)
                    .map_err(|e| DeliveryError::TemplateInvalid(format!("html body: {e}")))?,
            )
        } else {
            None
        };
        let body_text = if template.body_text.is_some() {
            Some(
                registry
                    .handlebars
                    .render(&text_key(id), &data)
                    .map_err(|e| DeliveryError::TemplateInvalid(format!("text body: {e}")))?,
            )
        } else {
            None
        };

        Ok(RenderedEmail {
            subject,
            body_html,
            body_text,
        })
    }
}

fn subject_key(id: &str) -> String {
    format!("{id}_subject")
}

fn html_key(id: &str) -> String {
    format!("{id}_html")
}

fn text_key(id: &str) -> String {
    format!("{id}_text")
}

fn register_into(registry: &mut Registry, template: EmailTemplate) -> DeliveryResult<()> {
    if template.id.trim().is_empty() {
        return Err(DeliveryError::TemplateInvalid(
            "template id must not be empty".to_string(),
        ));
    }
    if template.name.trim().is_empty() {
        return Err(DeliveryError::TemplateInvalid(
            "template name must not be empty".to_string(),
        ));
    }
    if template.subject.trim().is_empty() {
        return Err(DeliveryError::TemplateInvalid(
            "template subject must not be empty".to_string(),
        ));
    }
    if template.body_html.is_none() && template.body_text.is_none() {
        return Err(DeliveryError::TemplateInvalid(
            "template must define an HTML or text body".to_string(),
        ));
    }

    // Syntax-check all three fields on a scratch instance first, so a bad
    // template never leaves the registry half-updated.
    let mut probe = Handlebars::new();
    probe
        .register_template_string("subject", &template.subject)
        .map_err(|e| DeliveryError::TemplateInvalid(format!("subject: {e}")))?;
    if let Some(html) = &template.body_html {
        probe
            .register_template_string("html", html)
            .map_err(|e| DeliveryError::TemplateInvalid(format!("html body: {e}")))?;
    }
    if let Some(text) = &template.body_text {
        probe
            .register_template_string("text", text)
            .map_err(|e| DeliveryError::TemplateInvalid(format!("text body: {e}")))?;
    }

    registry
        .handlebars
        .register_template_string(&subject_key(&template.id), &template.subject)?;
    match &template.body_html {
        Some(html) => registry
            .handlebars
            .register_template_string(&html_key(&template.id), html)?,
        None => registry.handlebars.unregister_template(&html_key(&template.id)),
    }
    match &template.body_text {
        Some(text) => registry
            .handlebars
            .register_template_string(&text_key(&template.id), text)?,
        None => registry.handlebars.unregister_template(&text_key(&template.id)),
    }

    debug!(template_id = %template.id, "Registered email template");
    registry.templates.insert(template.id.clone(), template);
    Ok(())
}

/// Templates every engine ships with.
fn builtin_templates() -> Vec<EmailTemplate> {
    vec![
        EmailTemplate::new("welcome", "Welcome", "Welcome to {{app_name}}, {{user_name}}!")
            .with_variables(&["user_name", "app_name"])
            .with_text(
                r#"Hello {{user_name}},

Welcome to {{app_name}}!

We're excited to have you on board.

Best regards,
The {{app_name}} Team"#,
            )
            .with_html(
                r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
</head>
<body style="font-family: Arial, sans-serif; line-height: 1.6; color: #333;">
    <h1 style="color: #2563eb;">Welcome, {{user_name}}!</h1>
    <p>Thank you for joining <strong>{{app_name}}</strong>.</p>
    <p>We're excited to have you on board.</p>
    <p>Best regards,<br>The {{app_name}} Team</p>
</body>
</html>"#,
            ),
        EmailTemplate::new(
            "email_verification",
            "Email Verification",
            "Verify your email for {{app_name}}",
        )
        .with_variables(&["user_name", "verification_url", "app_name"])
        .with_text(
            r#"Hello {{user_name}},

Please verify your email address by clicking the link below:

{{verification_url}}

If you didn't create an account, you can safely ignore this email.

Best regards,
The {{app_name}} Team"#,
        )
        .with_html(
            r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
</head>
<body style="font-family: Arial, sans-serif; line-height: 1.6; color: #333;">
    <h1 style="color: #2563eb;">Verify Your Email</h1>
    <p>Hello {{user_name}},</p>
    <p>Please verify your email address by clicking the button below:</p>
    <p style="text-align: center; margin: 30px 0;">
        <a href="{{verification_url}}"
           style="background-color: #2563eb; color: white; padding: 12px 24px; text-decoration: none; border-radius: 6px; display: inline-block;">
            Verify Email
        </a>
    </p>
    <p style="color: #666; font-size: 14px;">If you didn't create an account, you can safely ignore this email.</p>
    <p>Best regards,<br>The {{app_name}} Team</p>
</body>
</html>"#,
        ),
        EmailTemplate::new("password_reset", "Password Reset", "Password Reset Request")
            .with_variables(&["user_name", "reset_url", "app_name"])
            .with_text(
                r#"Hello {{user_name}},

We received a request to reset your password.

Click the link below to reset your password:

{{reset_url}}

If you didn't request this, please ignore this email. Your password will remain unchanged.

Best regards,
The {{app_name}} Team"#,
            )
            .with_html(
                r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
</head>
<body style="font-family: Arial, sans-serif; line-height: 1.6; color: #333;">
    <h1 style="color: #2563eb;">Password Reset</h1>
    <p>Hello {{user_name}},</p>
    <p>We received a request to reset your password.</p>
    <p style="text-align: center; margin: 30px 0;">
        <a href="{{reset_url}}"
           style="background-color: #dc2626; color: white; padding: 12px 24px; text-decoration: none; border-radius: 6px; display: inline-block;">
            Reset Password
        </a>
    </p>
    <p style="color: #666; font-size: 14px;">If you didn't request this, please ignore this email. Your password will remain unchanged.</p>
    <p>Best regards,<br>The {{app_name}} Team</p>
</body>
</html>"#,
            ),
    ]
}
