pub mod match_request;
pub mod match_response;

pub use match_request::{MatchTutorsRequest, RequestTutor, TutorRecord};
pub use match_response::{ExcludedTutor, MatchTutorsResponse, MatchedTutor};
