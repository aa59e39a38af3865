pub mod documents;
pub mod gemini;
pub mod generation;
pub mod orchestrator;
pub mod populate;
pub mod queue;
pub mod request_store;
pub mod storage;
pub mod template;
pub mod workbook;
