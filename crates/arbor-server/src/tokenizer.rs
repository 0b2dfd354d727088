//! Chat tokenizer
//!
//! Deterministic placeholder tokenization: character-level text encoding,
//! fixed role-marker tokens, and a fixed-size token block per image.
//! Production would plug a HuggingFace tokenizer behind the same surface;
//! the cache manager only requires that identical inputs produce identical
//! token sequences.

use crate::openai::ChatMessage;
use arbor_types::{ArborError, Result, TokenId};

/// End-of-sequence token id.
pub const EOS_TOKEN: TokenId = 2;

/// Tokens emitted per embedded image (vision-encoder stand-in, 16x16 patches).
const IMAGE_PATCH_TOKENS: usize = 256;

const ROLE_SYSTEM: TokenId = 1000;
const ROLE_NEWLINE: TokenId = 1001;
const ROLE_USER: TokenId = 1002;
const ROLE_ASSISTANT: TokenId = 1003;

/// Converts chat messages to token sequences and back.
pub struct ChatTokenizer {
    vocab_size: usize,
}

impl ChatTokenizer {
    pub fn new(vocab_size: usize) -> Self {
        Self { vocab_size }
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// Encode text character-by-character into the vocabulary.
    pub fn encode_text(&self, text: &str) -> Result<Vec<TokenId>> {
        if text.is_empty() {
            return Err(ArborError::tokenizer("empty text"));
        }
        Ok(text
            .chars()
            .map(|ch| (ch as u32) % self.vocab_size as u32)
            .collect())
    }

    /// Encode a base64 image payload into a fixed block of patch tokens.
    pub fn encode_image(&self, image_base64: &str) -> Result<Vec<TokenId>> {
        if image_base64.is_empty() {
            return Err(ArborError::tokenizer("empty image data"));
        }
        validate_base64(image_base64)?;

        Ok((0..IMAGE_PATCH_TOKENS)
            .map(|i| i as u32 % self.vocab_size as u32)
            .collect())
    }

    /// Decode token ids back to text.
    pub fn decode(&self, tokens: &[TokenId]) -> Result<String> {
        if tokens.is_empty() {
            return Err(ArborError::tokenizer("empty tokens"));
        }
        Ok(tokens
            .iter()
            .map(|&token| char::from_u32(token).unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect())
    }

    /// Tokenize a full chat conversation: role markers, content, optional
    /// image block per message, terminated by the assistant prefix.
    pub fn tokenize_chat(&self, messages: &[ChatMessage]) -> Result<Vec<TokenId>> {
        if messages.is_empty() {
            return Err(ArborError::tokenizer("no messages in request"));
        }

        let mut tokens = Vec::new();
        for message in messages {
            tokens.extend_from_slice(&self.encode_role(&message.role)?);
            tokens.extend(self.encode_text(&message.content)?);
            if let Some(image) = &message.image {
                tokens.extend(self.encode_image(image)?);
            }
        }
        tokens.extend_from_slice(&self.assistant_prefix());

        Ok(tokens)
    }

    fn encode_role(&self, role: &str) -> Result<[TokenId; 2]> {
        match role {
            "system" => Ok([ROLE_SYSTEM, ROLE_NEWLINE]),
            "user" => Ok([ROLE_USER, ROLE_NEWLINE]),
            "assistant" => Ok([ROLE_ASSISTANT, ROLE_NEWLINE]),
            other => Err(ArborError::tokenizer(format!("unknown role: {}", other))),
        }
    }

    fn assistant_prefix(&self) -> [TokenId; 2] {
        [ROLE_ASSISTANT, ROLE_NEWLINE]
    }
}

/// Reject payloads that are not plausible standard base64.
fn validate_base64(data: &str) -> Result<()> {
    let trimmed = data.trim_end_matches('=');
    let padding = data.len() - trimmed.len();
    if data.len() % 4 != 0 || padding > 2 {
        return Err(ArborError::tokenizer("invalid base64 image"));
    }
    if !trimmed
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/')
    {
        return Err(ArborError::tokenizer("invalid base64 image"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenizer() -> ChatTokenizer {
        ChatTokenizer::new(32000)
    }

    #[test]
    fn test_encode_text_is_deterministic() {
        let tok = tokenizer();
        let a = tok.encode_text("hello world").unwrap();
        let b = tok.encode_text("hello world").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 11);
    }

    #[test]
    fn test_encode_text_rejects_empty() {
        assert!(tokenizer().encode_text("").is_err());
    }

    #[test]
    fn test_decode_round_trips_ascii() {
        let tok = tokenizer();
        let tokens = tok.encode_text("Hi").unwrap();
        assert_eq!(tok.decode(&tokens).unwrap(), "Hi");
    }

    #[test]
    fn test_chat_layout_has_role_markers_and_assistant_prefix() {
        let tok = tokenizer();
        let tokens = tok
            .tokenize_chat(&[ChatMessage::new("user", "Hi")])
            .unwrap();

        assert_eq!(&tokens[..2], &[ROLE_USER, ROLE_NEWLINE]);
        assert_eq!(&tokens[2..4], &['H' as u32, 'i' as u32]);
        assert_eq!(&tokens[4..], &[ROLE_ASSISTANT, ROLE_NEWLINE]);
    }

    #[test]
    fn test_shared_system_prompt_yields_shared_prefix() {
        // The caching property the whole server is built around: two
        // conversations with the same system prompt share a token prefix.
        let tok = tokenizer();
        let a = tok
            .tokenize_chat(&[
                ChatMessage::new("system", "You are helpful."),
                ChatMessage::new("user", "First question"),
            ])
            .unwrap();
        let b = tok
            .tokenize_chat(&[
                ChatMessage::new("system", "You are helpful."),
                ChatMessage::new("user", "Second question"),
            ])
            .unwrap();

        let shared = a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count();
        assert!(shared >= 2 + "You are helpful.".len());
    }

    #[test]
    fn test_unknown_role_is_rejected() {
        let tok = tokenizer();
        let err = tok
            .tokenize_chat(&[ChatMessage::new("tool", "data")])
            .unwrap_err();
        assert!(matches!(err, ArborError::Tokenizer { .. }));
    }

    #[test]
    fn test_image_contributes_fixed_token_block() {
        let tok = tokenizer();
        let mut message = ChatMessage::new("user", "look");
        message.image = Some("aGVsbG8=".to_string());
        let with_image = tok.tokenize_chat(&[message]).unwrap();
        let without_image = tok
            .tokenize_chat(&[ChatMessage::new("user", "look")])
            .unwrap();

        assert_eq!(with_image.len(), without_image.len() + IMAGE_PATCH_TOKENS);
    }

    #[test]
    fn test_invalid_base64_is_rejected() {
        let tok = tokenizer();
        assert!(tok.encode_image("not base64!!").is_err());
        assert!(tok.encode_image("abc").is_err());
        assert!(tok.encode_image("").is_err());
        assert!(tok.encode_image("aGVsbG8=").is_ok());
    }

    #[test]
    fn test_empty_messages_are_rejected() {
        assert!(tokenizer().tokenize_chat(&[]).is_err());
    }
}
