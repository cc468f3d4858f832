//! Prompt text for every pipeline stage.
//!
//! Each system prompt opens with a role line that is unique to its stage;
//! tests use those lines to script replies per stage.

use quarry_core::storage::Row;

use crate::history::ValidationHistoryEntry;
use crate::llm::Prompt;
use crate::types::{CandidateQuery, Feedback, RoutingDecision, ValidationOutcome};

pub const DEPENDENCY_ROLE: &str = "You decide whether a chat message depends on earlier conversation.";
pub const LIGHT_REWRITE_ROLE: &str = "You polish standalone requests without changing their intent.";
pub const CONTEXT_EXTRACTION_ROLE: &str = "You extract the earlier context a follow-up message refers to.";
pub const CONTEXT_REWRITE_ROLE: &str = "You rewrite follow-up messages into standalone requests.";
pub const ROUTER_ROLE: &str = "You route requests for a customer campaign analysis assistant.";
pub const DIRECT_ANSWER_ROLE: &str = "You are the conversational side of a customer campaign analysis assistant.";
pub const GENERATOR_ROLE: &str = "You write read-only SQL for customer segmentation and campaign targeting.";
pub const VALIDATOR_ROLE: &str = "You judge whether a SQL query and its results answer a marketing request.";
pub const ANALYST_ROLE: &str = "You explain customer targeting results to a marketing team.";
pub const GATE_ROLE: &str = "You decide whether a request asks for marketing message content.";
pub const TEMPLATES_ROLE: &str = "You write personalized marketing message templates per channel.";

/// Marker a model returns when no earlier turn is relevant.
pub const NO_RELEVANT_CONTEXT: &str = "NO_RELEVANT_CONTEXT";

/// Schema description used when no schema file is configured.
pub const DEFAULT_SCHEMA: &str = r#"Table `customers` (one row per customer per data source):
- id (integer, primary key)
- source_customer_id (text): id in the originating system
- data_source (text): originating system, e.g. 'shopify', 'klaviyo'
- email (text), first_name (text), last_name (text), phone (text)
- total_value (numeric): lifetime spend
- engagement_score (numeric, 0-100)
- lifecycle_stage (text): 'new', 'active', 'at_risk', 'churned', 'vip'
- purchase_intent (text): 'low', 'medium', 'high'
- segment (text)
- last_interaction (timestamp), last_engagement_time (timestamp)
- created_at (timestamp), updated_at (timestamp)
- accepts_marketing (boolean)
- timezone (text), engagement_frequency (text), device_preference (text)
- tags (json array of text)
- preferred_channels (json array): any of 'email', 'sms', 'whatsapp', 'ads'
- social_platforms (json object): platform -> handle
- optimal_send_times, seasonal_activity, channel_performance, communication_limits, source_data (json)"#;

/// Columns every targeting query must return so results can be contacted.
pub const MANDATORY_COLUMNS: [&str; 4] = ["email", "data_source", "first_name", "last_name"];

const DEPENDENCY_EXAMPLES: &[(&str, bool, &str)] = &[
    ("Show me all customers from the last 30 days", false, "Complete request with its own time range"),
    ("What about them?", true, "'them' points at an earlier result"),
    ("Find high value customers in California", false, "Names its own filters"),
    ("Now only the ones who opened an email", true, "'the ones' narrows an earlier audience"),
    ("Send a promo to that customer", true, "'that customer' needs an antecedent"),
    ("How many customers accept marketing?", false, "Standalone count"),
    ("And for last month?", true, "Repeats an earlier request with a new period"),
    ("Write an SMS for VIP customers who churned", false, "Audience and channel are explicit"),
    ("Do the same for whatsapp", true, "'the same' refers to an earlier request"),
    ("Hi, what can you do?", false, "Greeting, no reference"),
    ("Exclude those with no phone number", true, "'those' refers to an earlier audience"),
    ("List customers with engagement score above 80", false, "Explicit filter"),
    ("What is his email?", true, "'his' needs an earlier customer"),
    ("Customers tagged 'holiday' who bought in December", false, "Explicit filters"),
];

pub fn dependency_analysis(message: &str) -> Prompt {
    let examples: String = DEPENDENCY_EXAMPLES
        .iter()
        .map(|(q, needs, why)| format!("Message: \"{q}\"\n{{\"needs_context\": {needs}, \"reasoning\": \"{why}\"}}\n"))
        .collect::<Vec<_>>()
        .join("\n");

    let system = format!(
        "{DEPENDENCY_ROLE}\n\
         A message needs context when it uses pronouns or references (them, that, those, \
         the same, his, her) or is a fragment that only makes sense after an earlier turn. \
         A message that names its own audience, filters and goal does not.\n\
         Always respond with valid JSON."
    );
    let user = format!(
        "Examples:\n\n{examples}\n\
         Now analyze this message:\n\"{message}\"\n\n\
         Respond with JSON only:\n\
         {{\"needs_context\": true|false, \"confidence\": 0.0-1.0, \"reasoning\": \"short explanation\"}}"
    );
    Prompt::new(system, user).with_temperature(0.1)
}

pub fn light_rewrite(message: &str) -> Prompt {
    let system = format!(
        "{LIGHT_REWRITE_ROLE}\n\
         Make the request slightly clearer for a customer database assistant. Keep its meaning, \
         filters and wording where possible. If it is already clear, return it unchanged. \
         Reply with the request text only."
    );
    Prompt::new(system, message.to_string()).with_temperature(0.1)
}

pub fn context_extraction(message: &str, numbered_history: &str) -> Prompt {
    let system = format!(
        "{CONTEXT_EXTRACTION_ROLE}\n\
         Return only the facts from earlier messages the new message needs (a customer, an \
         audience, a filter, a time range). Be brief. If nothing earlier is relevant, reply \
         exactly {NO_RELEVANT_CONTEXT}."
    );
    let user = format!(
        "Earlier user messages, numbered from most recent (highest number) to oldest ([1]):\n\
         {numbered_history}\n\n\
         NOTE: when several messages could match, prefer the higher number; it is more recent.\n\n\
         New message: \"{message}\"\n\nRelevant context:"
    );
    Prompt::new(system, user).with_temperature(0.1)
}

pub fn context_rewrite(context: &str, message: &str) -> Prompt {
    let system = format!(
        "{CONTEXT_REWRITE_ROLE}\n\
         Replace every reference in the new message with the concrete thing it refers to, using \
         the context. For example \"write an email for him\" after a message about \
         example@email.com becomes \"write an email for the customer example@email.com\". \
         Keep the user's intent. Reply with the rewritten request only."
    );
    let user = format!("Context:\n{context}\n\nNew message: \"{message}\"\n\nStandalone request:");
    Prompt::new(system, user).with_temperature(0.1)
}

pub fn routing(message: &str) -> Prompt {
    let system = format!(
        "{ROUTER_ROLE}\n\
         Requests that need customer data (finding, counting, segmenting or targeting customers, \
         or writing campaigns for a described audience) go to the SQL pipeline. Greetings, \
         questions about the assistant and general marketing advice get a direct answer.\n\
         Respond with JSON only."
    );
    let user = format!(
        "Request: \"{message}\"\n\n\
         {{\"should_use_sql_agent\": true|false, \"reasoning\": \"one sentence\", \
         \"confidence_score\": 0.0-1.0, \"query_type\": \"campaign\"|\"general\"|\"sql_direct\"}}"
    );
    Prompt::new(system, user).with_temperature(0.7).with_max_tokens(256)
}

pub fn direct_answer(message: &str) -> Prompt {
    let system = format!(
        "{DIRECT_ANSWER_ROLE}\n\
         Answer helpfully and briefly. You can find and segment customers, explain results and \
         draft email, SMS, WhatsApp and ad messages for an audience."
    );
    Prompt::new(system, message.to_string()).with_temperature(0.3)
}

/// Prior-iteration feedback, or an empty string when there is none.
pub fn feedback_section(feedback: &Feedback) -> String {
    if feedback.is_empty() {
        return String::new();
    }

    let mut out = String::from("**FEEDBACK FROM PREVIOUS ATTEMPT:**\n");
    if let Some(error) = &feedback.execution_error {
        out.push_str(&format!(
            "SQL EXECUTION ERROR (CRITICAL): {error}\n\
             This query failed to execute. You MUST fix this error in your new query.\n"
        ));
    }
    if let Some(rationale) = &feedback.low_confidence_rationale {
        out.push_str(&format!("Validation Issue: {rationale}\n"));
    }
    if !feedback.improvement_suggestions.is_empty() {
        out.push_str("Specific Improvements Needed:\n");
        for (i, suggestion) in feedback.improvement_suggestions.iter().enumerate() {
            out.push_str(&format!("{}. {suggestion}\n", i + 1));
        }
    }
    out.push_str("PLEASE ADDRESS ALL THESE ISSUES IN YOUR NEW QUERY GENERATION.\n");
    out
}

/// Recent validation results, or an empty string when there are none.
pub fn recent_results_section(entries: &[ValidationHistoryEntry]) -> String {
    if entries.is_empty() {
        return String::new();
    }

    let mut out = String::from("**RECENT VALIDATION RESULTS (Learn from these):**\n");
    for (i, entry) in entries.iter().enumerate() {
        let verdict = if entry.outcome.valid { "Valid" } else { "Invalid" };
        out.push_str(&format!(
            "{}. Query: {}\n   Result: {verdict} (confidence: {:.2})\n",
            i + 1,
            entry.statement,
            entry.outcome.confidence
        ));
        if let Some(error) = &entry.outcome.error {
            out.push_str(&format!("   Error: {error}\n"));
        }
        if let Some(issue) = &entry.outcome.low_confidence_rationale {
            out.push_str(&format!("   Issue: {issue}\n"));
        }
    }
    out
}

pub fn generation(
    schema: &str,
    message: &str,
    decision: &RoutingDecision,
    feedback: &Feedback,
    recent: &[ValidationHistoryEntry],
) -> Prompt {
    let system = format!(
        "{GENERATOR_ROLE}\n\n\
         Database schema:\n{schema}\n\n\
         Rules:\n\
         - Only SELECT (or WITH ... SELECT) statements. Never modify data.\n\
         - Always return these columns: {}.\n\
         - Prefer explicit column lists over SELECT *.\n\
         - Respond with JSON only:\n\
         {{\"sql_query\": \"...\", \"explanation\": \"...\", \"confidence_score\": 0.0-1.0, \
         \"tables_used\": [\"...\"]}}",
        MANDATORY_COLUMNS.join(", ")
    );

    let mut user = format!(
        "Request: \"{message}\"\nRequest type: {:?} ({})\n",
        decision.category, decision.rationale
    );
    let recent = recent_results_section(recent);
    if !recent.is_empty() {
        user.push('\n');
        user.push_str(&recent);
    }
    let feedback = feedback_section(feedback);
    if !feedback.is_empty() {
        user.push('\n');
        user.push_str(&feedback);
    }
    Prompt::new(system, user).with_temperature(0.7).with_max_tokens(5000)
}

fn rows_json(rows: &[Row]) -> String {
    serde_json::to_string_pretty(rows).unwrap_or_else(|_| "[]".to_string())
}

pub fn validation(schema: &str, intent: &str, candidate: &CandidateQuery, sample: &[Row], total_rows: usize) -> Prompt {
    let system = format!(
        "{VALIDATOR_ROLE}\n\n\
         Database schema:\n{schema}\n\n\
         Judge whether the query selects the audience the request describes and whether the \
         sample rows look right. Respond with JSON only:\n\
         {{\"is_valid\": true|false, \"confidence_score\": 0.0-1.0, \"validation_details\": \"...\", \
         \"error_message\": null, \"low_confidence_explanation\": \"why confidence is not higher, or null\", \
         \"improvement_suggestions\": [\"...\"]}}"
    );
    let user = format!(
        "Request: \"{intent}\"\n\nQuery:\n{}\n\nGenerator's explanation: {}\n\n\
         The query returned {total_rows} rows. Sample ({} rows):\n{}",
        candidate.statement,
        candidate.explanation,
        sample.len(),
        rows_json(sample)
    );
    Prompt::new(system, user).with_temperature(0.7).with_max_tokens(3000)
}

/// Business wording for a targeting confidence.
pub fn describe_confidence(confidence: f64) -> &'static str {
    match confidence {
        c if c >= 0.9 => "Excellent targeting accuracy",
        c if c >= 0.7 => "Good targeting accuracy",
        c if c >= 0.5 => "Moderate targeting accuracy",
        _ => "Low targeting accuracy - may need refinement",
    }
}

pub fn analyst_summary(intent: &str, candidate: &CandidateQuery, outcome: &ValidationOutcome, sample: &[Row]) -> Prompt {
    let system = format!(
        "{ANALYST_ROLE}\n\
         Write for marketers, not engineers: no SQL, no column names in backticks. Say who the \
         audience is, how large it is, what stands out, and one or two next steps."
    );
    let user = if outcome.rows.is_empty() {
        format!(
            "Request: \"{intent}\"\n\nNo customers matched. Targeting logic: {}\n\n\
             Explain briefly why the audience may be empty and suggest how to broaden it.",
            candidate.explanation
        )
    } else {
        format!(
            "Request: \"{intent}\"\n\nMatched customers: {}\nTargeting logic: {}\nQuality: {}\n\n\
             Sample records:\n{}",
            outcome.rows.len(),
            candidate.explanation,
            describe_confidence(outcome.confidence),
            rows_json(sample)
        )
    };
    Prompt::new(system, user).with_temperature(0.7)
}

pub fn personalization_gate(message: &str) -> Prompt {
    let system = format!(
        "{GATE_ROLE}\n\
         Say yes only when the user wants message copy written (emails, SMS, WhatsApp \
         messages, ads, campaign content). Finding or counting customers alone is a no.\n\
         Respond with JSON only."
    );
    let user = format!(
        "Request: \"{message}\"\n\n\
         {{\"needs_marketing_messages\": true|false, \"reasoning\": \"...\", \"confidence\": 0.0-1.0}}"
    );
    Prompt::new(system, user).with_temperature(0.3).with_max_tokens(500)
}

pub fn channel_templates(message: &str, columns: &[String], sample: &[Row]) -> Prompt {
    let placeholders: Vec<String> = columns.iter().map(|c| format!("{{{{{c}}}}}")).collect();
    let system = format!(
        "{TEMPLATES_ROLE}\n\
         Channels: email, sms, whatsapp, ads. Pick the channels the request asks for, or the \
         ones that fit the audience. Personalize with placeholders in double braces; only these \
         are available: {}.\n\
         Respond with a JSON array only:\n\
         [{{\"channel\": \"email\", \"subject\": \"...\", \"message\": \"...\"}}, \
         {{\"channel\": \"sms\", \"message\": \"...\"}}]\n\
         Email needs both subject and message; other channels need message only.",
        placeholders.join(", ")
    );
    let user = format!(
        "Request: \"{message}\"\n\nAudience sample:\n{}",
        rows_json(sample)
    );
    Prompt::new(system, user).with_temperature(0.8)
}
