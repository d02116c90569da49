use crate::config::Config;
use crate::db::Db;
use crate::flow::CallFlowController;
use crate::synthesizer::SpeechSynthesizer;

use std::sync::Arc;

pub struct AppState {
    pub config: Config,
    pub db: Db,
    pub controller: CallFlowController,
    pub synthesizer: Arc<SpeechSynthesizer>,
}
