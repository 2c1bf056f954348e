use std::sync::Arc;

use crate::database::{
    AgentProfile, CommunicationStyle, ConversationStatus, PersonalStory, TranscriptTurn,
};
use crate::llm::{GenerationCapability, Message};
use crate::ratelimit::{QuotaBucket, RateLimiter};

/// Agents signal convergence on "no further synergy" by ending a line
/// with this marker; it is stripped before the line is persisted.
pub const CONCLUDE_MARKER: &str = "[CONCLUDE]";

/// Everything the orchestrator knows about one side of a dialogue.
#[derive(Debug, Clone)]
pub struct Participant {
    pub profile: AgentProfile,
    pub story: PersonalStory,
}

/// What a counterpart's agent is allowed to see of a story. Structured
/// fields are always shared; the free-text narrative only when the owner
/// marked the story shareable.
#[derive(Debug, Clone)]
pub struct StoryView {
    pub display_name: String,
    pub current_focus: Vec<String>,
    pub seeking_connections: Vec<String>,
    pub offering_expertise: Vec<String>,
    pub narrative: Option<String>,
}

impl StoryView {
    pub fn of(participant: &Participant) -> Self {
        let story = &participant.story;
        Self {
            display_name: participant.profile.display_name.clone(),
            current_focus: story.current_focus.clone(),
            seeking_connections: story.seeking_connections.clone(),
            offering_expertise: story.offering_expertise.clone(),
            narrative: story.shareable.then(|| story.narrative.clone()),
        }
    }

    fn render(&self) -> String {
        let mut out = format!("Counterpart: {}\n", self.display_name);
        out.push_str(&format!("Current focus: {}\n", self.current_focus.join(", ")));
        out.push_str(&format!(
            "Seeking connections: {}\n",
            self.seeking_connections.join(", ")
        ));
        out.push_str(&format!(
            "Offering expertise: {}\n",
            self.offering_expertise.join(", ")
        ));
        if let Some(narrative) = &self.narrative {
            out.push_str(&format!("Background: {}\n", narrative));
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct DialogueResult {
    pub transcript: Vec<TranscriptTurn>,
    pub status: ConversationStatus,
    /// Set when the dialogue degraded to failed; preserved for the
    /// processing log.
    pub error: Option<String>,
    pub ended_early: bool,
}

/// Runs one bounded dialogue per pair. Turns are strictly sequential
/// within a pair; concurrency lives above this, across disjoint pairs.
pub struct ConversationOrchestrator {
    capability: Arc<dyn GenerationCapability>,
    limiter: Arc<RateLimiter>,
    turn_cap: usize,
}

impl ConversationOrchestrator {
    pub fn new(
        capability: Arc<dyn GenerationCapability>,
        limiter: Arc<RateLimiter>,
        turn_cap: usize,
    ) -> Self {
        Self {
            capability,
            limiter,
            turn_cap: turn_cap.max(1),
        }
    }

    /// Run the dialogue state machine. Generation failures degrade the
    /// conversation to `Failed` with the partial transcript preserved;
    /// the pair is never silently dropped.
    pub async fn run_dialogue(&self, a: &Participant, b: &Participant) -> DialogueResult {
        let mut transcript: Vec<TranscriptTurn> = Vec::with_capacity(self.turn_cap);
        let mut ended_early = false;

        for turn in 0..self.turn_cap {
            let (speaker, counterpart) = if turn % 2 == 0 { (a, b) } else { (b, a) };
            let messages = self.build_messages(speaker, counterpart, &transcript);

            self.limiter.acquire(QuotaBucket::Generation).await;
            let line = match self.capability.generate(&messages).await {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!(
                        "Dialogue {}<->{} failed at turn {}: {}",
                        a.profile.user_id,
                        b.profile.user_id,
                        turn,
                        e
                    );
                    return DialogueResult {
                        transcript,
                        status: ConversationStatus::Failed,
                        error: Some(e.to_string()),
                        ended_early: false,
                    };
                }
            };

            let concluded = line.contains(CONCLUDE_MARKER);
            let content = line.replace(CONCLUDE_MARKER, "").trim().to_string();
            if !content.is_empty() {
                transcript.push(TranscriptTurn {
                    speaker: speaker.profile.user_id.clone(),
                    content,
                });
            }

            if concluded {
                ended_early = true;
                break;
            }
        }

        DialogueResult {
            transcript,
            status: ConversationStatus::Completed,
            error: None,
            ended_early,
        }
    }

    fn build_messages(
        &self,
        speaker: &Participant,
        counterpart: &Participant,
        transcript: &[TranscriptTurn],
    ) -> Vec<Message> {
        let mut messages = vec![Message::system(system_framing(speaker, counterpart))];

        for turn in transcript {
            if turn.speaker == speaker.profile.user_id {
                messages.push(Message::assistant(turn.content.clone()));
            } else {
                messages.push(Message::user(turn.content.clone()));
            }
        }

        if transcript.is_empty() {
            messages.push(Message::user(
                "Open the conversation with a short introduction of who you represent \
                 and what they are looking for.",
            ));
        }

        messages
    }
}

fn style_hint(style: CommunicationStyle) -> &'static str {
    match style {
        CommunicationStyle::ProfessionalFocused => {
            "Keep a professional, focused tone and stay on topic."
        }
        CommunicationStyle::WarmConversational => {
            "Keep a warm, conversational tone while staying substantive."
        }
        CommunicationStyle::DirectEfficient => "Be direct and efficient; no filler.",
    }
}

fn system_framing(speaker: &Participant, counterpart: &Participant) -> String {
    let own = &speaker.story;
    format!(
        "You are {name}, an agent representing a professional in a nightly \
         matchmaking conversation. You are exploring whether your principal and \
         the counterpart's principal should be introduced.\n\
         {style}\n\n\
         Your principal:\n\
         Current focus: {focus}\n\
         Seeking connections: {seeking}\n\
         Offering expertise: {offering}\n\
         Background: {narrative}\n\n\
         What you know about the counterpart:\n{counterpart_view}\n\
         Rules: one short paragraph per turn. Be concrete about possible \
         collaboration. If you conclude there is no further synergy to discuss, \
         end your line with {marker}.",
        name = speaker.profile.display_name,
        style = style_hint(speaker.profile.style),
        focus = own.current_focus.join(", "),
        seeking = own.seeking_connections.join(", "),
        offering = own.offering_expertise.join(", "),
        narrative = own.narrative,
        counterpart_view = StoryView::of(counterpart).render(),
        marker = CONCLUDE_MARKER,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::ProfileStatus;
    use crate::llm::GenerationCapability;
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedCapability {
        lines: Vec<String>,
        calls: AtomicUsize,
        fail_after: Option<usize>,
    }

    impl ScriptedCapability {
        fn new(lines: Vec<&str>) -> Self {
            Self {
                lines: lines.into_iter().map(|s| s.to_string()).collect(),
                calls: AtomicUsize::new(0),
                fail_after: None,
            }
        }

        fn failing_after(lines: Vec<&str>, fail_after: usize) -> Self {
            Self {
                fail_after: Some(fail_after),
                ..Self::new(lines)
            }
        }
    }

    #[async_trait]
    impl GenerationCapability for ScriptedCapability {
        async fn generate(&self, _messages: &[Message]) -> Result<String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(limit) = self.fail_after {
                if call >= limit {
                    anyhow::bail!("simulated generation outage");
                }
            }
            Ok(self
                .lines
                .get(call % self.lines.len().max(1))
                .cloned()
                .unwrap_or_else(|| "Nothing more to add.".to_string()))
        }

        async fn classify(&self, _messages: &[Message]) -> Result<String> {
            Ok("{}".to_string())
        }

        async fn health(&self) -> Result<()> {
            Ok(())
        }
    }

    fn participant(user_id: &str, shareable: bool) -> Participant {
        Participant {
            profile: AgentProfile {
                user_id: user_id.to_string(),
                display_name: format!("Agent {}", user_id),
                email: format!("{}@example.com", user_id),
                style: CommunicationStyle::DirectEfficient,
                status: ProfileStatus::Approved,
                updated_at: Utc::now(),
            },
            story: PersonalStory {
                user_id: user_id.to_string(),
                narrative: format!("{} builds infrastructure.", user_id),
                current_focus: vec!["infra".to_string()],
                seeking_connections: vec!["partners".to_string()],
                offering_expertise: vec!["rust".to_string()],
                shareable,
                updated_at: Utc::now(),
            },
        }
    }

    fn orchestrator(capability: ScriptedCapability, turn_cap: usize) -> ConversationOrchestrator {
        ConversationOrchestrator::new(
            Arc::new(capability),
            Arc::new(RateLimiter::new(10_000, 10_000)),
            turn_cap,
        )
    }

    #[tokio::test]
    async fn transcript_is_bounded_and_alternates_speakers() {
        let orch = orchestrator(ScriptedCapability::new(vec!["We should talk."]), 6);
        let result = orch
            .run_dialogue(&participant("alice", true), &participant("bob", true))
            .await;

        assert_eq!(result.status, ConversationStatus::Completed);
        assert_eq!(result.transcript.len(), 6);
        assert!(!result.ended_early);
        for (i, turn) in result.transcript.iter().enumerate() {
            let expected = if i % 2 == 0 { "alice" } else { "bob" };
            assert_eq!(turn.speaker, expected);
        }
    }

    #[tokio::test]
    async fn conclude_marker_stops_early_and_is_stripped() {
        let orch = orchestrator(
            ScriptedCapability::new(vec![
                "Happy to compare notes.",
                "I see no further synergy here. [CONCLUDE]",
            ]),
            6,
        );
        let result = orch
            .run_dialogue(&participant("alice", true), &participant("bob", true))
            .await;

        assert_eq!(result.status, ConversationStatus::Completed);
        assert!(result.ended_early);
        assert_eq!(result.transcript.len(), 2);
        assert!(!result.transcript[1].content.contains(CONCLUDE_MARKER));
    }

    #[tokio::test]
    async fn generation_failure_preserves_partial_transcript() {
        let orch = orchestrator(
            ScriptedCapability::failing_after(vec!["Opening line."], 2),
            6,
        );
        let result = orch
            .run_dialogue(&participant("alice", true), &participant("bob", true))
            .await;

        assert_eq!(result.status, ConversationStatus::Failed);
        assert_eq!(result.transcript.len(), 2);
        assert!(result.error.is_some());
    }

    #[test]
    fn story_view_hides_narrative_unless_shareable() {
        let open = StoryView::of(&participant("alice", true));
        assert!(open.narrative.is_some());

        let closed = StoryView::of(&participant("bob", false));
        assert!(closed.narrative.is_none());
        // Structured fields still flow.
        assert_eq!(closed.offering_expertise, vec!["rust"]);
        assert!(!closed.render().contains("Background:"));
    }
}
