pub fn wrap_twiml(twiml: String) -> String {
    format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>{twiml}")
}

mod twiml {
    use xmlserde::xml_serde_enum;
    use xmlserde_derives::XmlSerialize;

    #[derive(PartialEq, Eq, XmlSerialize, Debug)]
    #[xmlserde(root = b"Response")]
    pub struct Response {
        #[xmlserde(ty = "untag")]
        pub actions: Vec<ResponseAction>,
    }

    #[derive(PartialEq, Eq, XmlSerialize, Debug)]
    pub enum ResponseAction {
        #[xmlserde(name = b"Say")]
        Say(SayAction),
        #[xmlserde(name = b"Play")]
        Play(PlayAction),
        #[xmlserde(name = b"Gather")]
        Gather(GatherAction),
        #[xmlserde(name = b"Redirect")]
        Redirect(RedirectAction),
        #[xmlserde(name = b"Hangup")]
        Hangup(HangupAction),
    }

    #[derive(PartialEq, Eq, XmlSerialize, Default, Debug)]
    pub struct SayAction {
        #[xmlserde(ty = "text")]
        pub text: String,
        #[xmlserde(name = b"voice", ty = "attr")]
        pub voice: Option<String>,
        #[xmlserde(name = b"loop", ty = "attr")]
        pub lp: Option<u16>,
        #[xmlserde(name = b"language", ty = "attr")]
        pub language: Option<String>,
    }

    #[derive(PartialEq, Eq, XmlSerialize, Default, Debug)]
    pub struct PlayAction {
        #[xmlserde(ty = "text")]
        pub url: String,
        #[xmlserde(name = b"loop", ty = "attr")]
        pub lp: Option<u16>,
    }

    #[derive(PartialEq, Eq, XmlSerialize, Default, Debug)]
    pub struct GatherAction {
        #[xmlserde(name = b"input", ty = "attr")]
        pub input: Option<GatherInput>,
        #[xmlserde(name = b"action", ty = "attr")]
        pub action: Option<String>,
        #[xmlserde(name = b"method", ty = "attr")]
        pub method: Option<String>,
        #[xmlserde(name = b"language", ty = "attr")]
        pub language: Option<String>,
        #[xmlserde(name = b"speechTimeout", ty = "attr")]
        pub speech_timeout: Option<String>,
        #[xmlserde(name = b"timeout", ty = "attr")]
        pub timeout: Option<u16>,
        #[xmlserde(name = b"hints", ty = "attr")]
        pub hints: Option<String>,
    }

    xml_serde_enum! {
        #[derive(PartialEq, Eq, Debug)]
        GatherInput {
            Speech => "speech",
        }
    }

    #[derive(PartialEq, Eq, XmlSerialize, Default, Debug)]
    pub struct RedirectAction {
        #[xmlserde(ty = "text")]
        pub url: String,
        #[xmlserde(name = b"method", ty = "attr")]
        pub method: Option<String>,
    }

    #[derive(PartialEq, Eq, XmlSerialize, Default, Debug)]
    pub struct HangupAction {}
}
pub use twiml::*;

mod webhook {
    use serde::Deserialize;

    #[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
    #[serde(rename_all = "kebab-case")]
    pub enum CallStatus {
        Queued,
        Initiated,
        Ringing,
        InProgress,
        Completed,
        Busy,
        Failed,
        NoAnswer,
        Canceled,
    }

    impl CallStatus {
        /// The call is over and no further webhooks will arrive for it.
        pub fn is_terminal(self) -> bool {
            matches!(
                self,
                CallStatus::Completed
                    | CallStatus::Busy
                    | CallStatus::Failed
                    | CallStatus::NoAnswer
                    | CallStatus::Canceled
            )
        }

        pub fn as_str(self) -> &'static str {
            match self {
                CallStatus::Queued => "queued",
                CallStatus::Initiated => "initiated",
                CallStatus::Ringing => "ringing",
                CallStatus::InProgress => "in-progress",
                CallStatus::Completed => "completed",
                CallStatus::Busy => "busy",
                CallStatus::Failed => "failed",
                CallStatus::NoAnswer => "no-answer",
                CallStatus::Canceled => "canceled",
            }
        }
    }

    /// Body of the voice webhooks (`/inbound`, `/outbound`, `/process`).
    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "PascalCase")]
    pub struct VoicePayload {
        pub call_sid: String,
        #[serde(default)]
        pub from: Option<String>,
        #[serde(default)]
        pub speech_result: Option<String>,
        #[serde(default)]
        pub confidence: Option<f32>,
    }

    /// Body of the status callback.
    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "PascalCase")]
    pub struct StatusPayload {
        pub call_sid: String,
        pub call_status: CallStatus,
        #[serde(default)]
        pub call_duration: Option<u32>,
        #[serde(default)]
        pub from: Option<String>,
        #[serde(default)]
        pub to: Option<String>,
    }
}
pub use webhook::*;
