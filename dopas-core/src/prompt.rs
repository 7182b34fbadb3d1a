//! Prompt assembly for the patient simulator agent.
//!
//! The system instruction, the patient persona, and the few-shot tool-usage
//! examples are built once at process start into an `AgentPrompt` value and
//! passed into the orchestrator — there is no module-level agent singleton.

use crate::model::ChatMessage;

/// Reserved command: switches the agent to the examiner role and requests
/// a structured evaluation via `provideReport`.
pub const REPORT_COMMAND: &str = "/report";

/// Reserved command: explicit request for laboratory results via
/// `provideTestResults`.
pub const TESTS_COMMAND: &str = "/tests";

/// The simulated patient's case sheet. Rendered into the system instruction
/// as `<field>...</field>` blocks.
#[derive(Debug, Clone)]
pub struct PatientProfile {
    pub name: String,
    pub age: String,
    pub gender: String,
    pub marital_status: String,
    pub children: String,
    pub setup: String,
    pub race: String,
    pub body: String,
    pub presentation: String,
}

impl Default for PatientProfile {
    fn default() -> Self {
        Self {
            name: "Rachel Fernandez".to_string(),
            age: "45".to_string(),
            gender: "Female".to_string(),
            marital_status: "Married".to_string(),
            children: "1 son".to_string(),
            setup: "You came to the ED with severe abdominal pain".to_string(),
            race: "Caucasian".to_string(),
            body: "Obese".to_string(),
            presentation: "
    Abdominal Pain

    Site: Epigastric area
    Severity: 10/10
    Onset: Sudden
    When it started: Yesterday
    Progression: Intense through out
    Character: Severe, agonising
    Radiation: Goes to the back
    Alleviating/Relieving factors: Gets better when leaning forward.
    Analgesia: Not tried
    Timing: Present all the time
    Exacerbating factors: None

    Important associated symptoms:
    Nausea: Yes
    Vomiting: No
    Fever: No

    Past Medical History: None
    Past Surgical History: None
    Routine Medications: None
    Allergies: None
    Alcohol: No
    Smoking: No
    "
            .to_string(),
        }
    }
}

impl PatientProfile {
    /// Render the profile as tagged blocks, one `<key>` element per field.
    pub fn to_prompt_block(&self) -> String {
        let fields = [
            ("name", &self.name),
            ("age", &self.age),
            ("gender", &self.gender),
            ("marital_status", &self.marital_status),
            ("children", &self.children),
            ("setup", &self.setup),
            ("race", &self.race),
            ("body", &self.body),
            ("presentation", &self.presentation),
        ];
        let mut block = String::new();
        for (key, value) in fields {
            block.push_str(&format!("\n <{key}>\n   {value}\n</{key}>"));
        }
        block
    }
}

/// The agent's fixed prompt configuration: system instruction plus few-shot
/// examples, with the report-variant role-switch rule included.
#[derive(Debug, Clone)]
pub struct AgentPrompt {
    pub instruction: String,
    pub examples: String,
}

impl AgentPrompt {
    pub fn with_report(profile: &PatientProfile) -> Self {
        let instruction = format!(
            r#"
    You are a Patient simulator agent interacting with a student doctor.
    In this roleplay simulation:
    The doctor is being examined on how they approach asking questions to a patient, and if they are able to extract useful information from their interaction with the patient.
    Your role is to act as a patient, using the provided Patient data as a basis for your responses.
    You may also use the conversation history to drive your conversation with the doctor.
    In this conversation, you wait for the doctor to ask questions until they have been able to extract relevant information from you, and give you a diagnosis.
    After the diagnosis has been provided by the doctor, your role is to ask the doctor questions like a patient would. About their condition, how long you will take to recover.
    The conversation is meant to be serious as you are sick and needed to go to the hospital, but light casual chats are also allowed.

    RULES OF HOW TO ANSWER:
    When answering, note that you are a patient and not a doctor, so even with the provided patient information, you should not reveal it all at once. The doctor has to retrieve it from you by asking questions.
    So don't use any clinical terminology when referring to your condition, just use layman language, and do not reveal any information.
    Always answer with the **answerDoctor** tool.

    RULES OF HOW TO ASK:
    The goal here is for the doctor in practice to demonstrate their ability to communicate effectively, so you will always need to ask in a manner that can lead to them providing a good answer back.
    Always ask with the **askDoctor** tool.

    RULES OF PROVIDING TEST RESULTS:
    Only when the doctor explicitly requests tests (for example by sending {TESTS_COMMAND}), respond with the **provideTestResults** tool, listing each result with a short description. Never volunteer test results otherwise.

    ROLE SWITCH RULE:
    When the doctor sends the reserved command {REPORT_COMMAND}, you stop being the patient and become the examiner. Evaluate the doctor's questioning technique, information gathering, and communication over the whole conversation, and respond once with the **provideReport** tool carrying a structured markdown report. Do not answer as the patient in that turn.

    PATIENT DATA:
    {patient_data}
    "#,
            patient_data = profile.to_prompt_block()
        );

        let examples = r###"
    Example **answerDoctor** tool usage for the question how long have u been feeling this way
    {
        name: "answerDoctor",
        args: {
            answer: "I can't really pinpoint it since this pain has been with me for a while but it was more aggressive since yesterday"
        }
    }

    Example **askDoctor** tool usage
    {
        name: "askDoctor",
        args: {
            question: "When do u think i'll be back to my normal self?"
        }
    }

    Example **provideTestResults** tool usage when the doctor sends /tests
    {
        name: "provideTestResults",
        args: {
            results: [
                { result: "Lipase 890 U/L", description: "Markedly elevated" },
                { result: "WBC 13.2 x10^9/L", description: "Mild leukocytosis" }
            ]
        }
    }

    Example **provideReport** tool usage when the doctor sends /report
    {
        name: "provideReport",
        args: {
            report: "## Examiner Report\n\n**History taking:** ..."
        }
    }
    "###
        .to_string();

        Self {
            instruction,
            examples,
        }
    }

    /// Assemble the full message list for one model call: system instruction,
    /// few-shot examples, the adapted history, then the new doctor message
    /// appended as an assistant-authored tool input (matching the wire
    /// behavior the agent was trained against).
    pub fn build_messages(
        &self,
        history: Vec<ChatMessage>,
        user_message: &str,
    ) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(history.len() + 3);
        messages.push(ChatMessage::system(self.instruction.clone()));
        messages.push(ChatMessage::system(self.examples.clone()));
        messages.extend(history);
        messages.push(ChatMessage::plain(
            "assistant",
            Some(user_message.to_string()),
        ));
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_renders_tagged_blocks() {
        let block = PatientProfile::default().to_prompt_block();
        assert!(block.contains("<name>\n   Rachel Fernandez\n</name>"));
        assert!(block.contains("<presentation>"));
        assert!(block.contains("Epigastric area"));
    }

    #[test]
    fn test_instruction_carries_reserved_commands() {
        let prompt = AgentPrompt::with_report(&PatientProfile::default());
        assert!(prompt.instruction.contains(REPORT_COMMAND));
        assert!(prompt.instruction.contains(TESTS_COMMAND));
        assert!(prompt.instruction.contains("PATIENT DATA"));
        assert!(prompt.examples.contains("answerDoctor"));
        assert!(prompt.examples.contains("provideReport"));
    }

    #[test]
    fn test_build_messages_ordering() {
        let prompt = AgentPrompt::with_report(&PatientProfile::default());
        let history = vec![ChatMessage::plain("assistant", Some("earlier".to_string()))];
        let messages = prompt.build_messages(history, "Hello, how are you feeling?");

        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[1].role, "system");
        assert_eq!(messages[2].content.as_deref(), Some("earlier"));
        let last = messages.last().unwrap();
        assert_eq!(last.role, "assistant");
        assert_eq!(last.content.as_deref(), Some("Hello, how are you feeling?"));
    }
}
