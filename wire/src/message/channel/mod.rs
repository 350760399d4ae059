mod close;
mod funding;
mod open;
mod operation;

pub use self::close::*;
pub use self::funding::*;
pub use self::open::*;
pub use self::operation::*;
