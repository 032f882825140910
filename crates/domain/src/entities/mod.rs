//! Records owned by the session store

mod member_record;
mod session_record;

pub use member_record::MemberRecord;
pub use session_record::SessionRecord;
