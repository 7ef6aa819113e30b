// Request construction for the hosted chat-completion model.
//
// The model sees one system message carrying the current personality
// profile and the last few turns, followed by the user's new message.

use companion_core::personality::PersonalityProfile;
use companion_core::store::ChatTurn;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

/// OpenAI-compatible `/chat/completions` request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f64,
    pub stream: bool,
}

/// Render prior turns as `用户：{message}\n{reply}` blocks, oldest first.
pub fn format_history(turns: &[ChatTurn]) -> String {
    turns
        .iter()
        .map(|t| format!("用户：{}\n{}", t.user_message, t.reply))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn system_prompt(profile: &PersonalityProfile, history: &[ChatTurn]) -> String {
    format!(
        "根据当前性格参数生成回复：\n{}\n对话历史：{}",
        profile.to_prompt_json(),
        format_history(history)
    )
}

pub fn build_request(
    model: &str,
    profile: &PersonalityProfile,
    history: &[ChatTurn],
    user_input: &str,
    stream: bool,
) -> CompletionRequest {
    let temperature = (profile.sampling_temperature() * 100.0).round() / 100.0;
    CompletionRequest {
        model: model.to_string(),
        messages: vec![
            ChatMessage::system(system_prompt(profile, history)),
            ChatMessage::user(user_input),
        ],
        temperature,
        stream,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use companion_core::config::PersonalityConfig;
    use companion_core::personality::PersonalityAnalyzer;

    fn neutral() -> PersonalityProfile {
        PersonalityAnalyzer::new(&PersonalityConfig::default()).default_profile()
    }

    #[test]
    fn history_formats_each_turn() {
        let turns = vec![ChatTurn::new("早上好", "早呀"), ChatTurn::new("吃了吗", "还没")];
        assert_eq!(format_history(&turns), "用户：早上好\n早呀\n用户：吃了吗\n还没");
    }

    #[test]
    fn empty_history_is_empty_string() {
        assert_eq!(format_history(&[]), "");
    }

    #[test]
    fn system_prompt_embeds_profile_without_escaping() {
        let prompt = system_prompt(&neutral(), &[]);
        assert!(prompt.starts_with("根据当前性格参数生成回复：\n"));
        assert!(prompt.contains(r#""傲娇指数":0.5"#), "prompt was {prompt}");
        assert!(prompt.ends_with("对话历史："));
    }

    #[test]
    fn request_has_system_then_user_message() {
        let history = vec![ChatTurn::new("你好", "哼")];
        let req = build_request("deepseek-reasoner", &neutral(), &history, "有什么计划吗", false);

        assert_eq!(req.model, "deepseek-reasoner");
        assert_eq!(req.messages.len(), 2);
        assert_eq!(req.messages[0].role, "system");
        assert!(req.messages[0].content.contains("用户：你好\n哼"));
        assert_eq!(req.messages[1], ChatMessage::user("有什么计划吗"));
        assert!(!req.stream);
    }

    #[test]
    fn request_uses_profile_temperature() {
        let req = build_request("m", &neutral(), &[], "hi", true);
        assert_eq!(req.temperature, 0.65);
        assert!(req.stream);
    }

    #[test]
    fn request_serializes_to_openai_shape() {
        let req = build_request("m", &neutral(), &[], "hi", false);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["messages"][1]["role"], "user");
        assert_eq!(json["messages"][1]["content"], "hi");
        assert_eq!(json["stream"], false);
    }
}
