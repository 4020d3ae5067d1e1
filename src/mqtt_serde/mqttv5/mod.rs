// SPDX-License-Identifier: MPL-2.0

pub mod common;

pub mod disconnect;
pub mod puback;
pub mod pubcomp;
pub mod publish;
pub mod pubrec;
pub mod pubrel;

pub use common::properties::Properties;
pub use common::properties::Property;

//re-export mod with suffix v5 for easier access
pub use disconnect as disconnectv5;
pub use puback as pubackv5;
pub use pubcomp as pubcompv5;
pub use publish as publishv5;
pub use pubrec as pubrecv5;
pub use pubrel as pubrelv5;
