//! Symbol table mapping qualified names to class members.

use crate::cfg::{MemberRef, NodeId};
use oox_syntax::{DeclarationMember, Identifier, NonVoidType};
use std::collections::BTreeMap;

/// Resolved information about a method or constructor.
#[derive(Debug, Clone)]
pub struct MemberInfo {
    pub class_name: Identifier,
    pub decl: DeclarationMember,
    /// The member's `MemberEntry` node.
    pub entry: NodeId,
    /// The member's `MemberExit` node.
    pub exit: NodeId,
}

impl MemberInfo {
    pub fn is_static(&self) -> bool {
        matches!(
            self.decl,
            DeclarationMember::Method {
                is_static: true,
                ..
            }
        )
    }

    pub fn is_constructor(&self) -> bool {
        matches!(self.decl, DeclarationMember::Constructor { .. })
    }
}

/// Per-class information.
#[derive(Debug, Clone)]
pub struct ClassInfo {
    /// Declared fields in declaration order.
    pub fields: Vec<(Identifier, NonVoidType)>,
}

/// Symbol table for a compilation unit.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    members: BTreeMap<MemberRef, MemberInfo>,
    classes: BTreeMap<Identifier, ClassInfo>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert_class(&mut self, name: Identifier, info: ClassInfo) {
        self.classes.insert(name, info);
    }

    pub(crate) fn insert_member(
        &mut self,
        member: MemberRef,
        info: MemberInfo,
    ) -> Option<MemberInfo> {
        self.members.insert(member, info)
    }

    /// Look up a member by class and member name.
    pub fn lookup(&self, class_name: &str, member_name: &str) -> Option<&MemberInfo> {
        self.members.get(&MemberRef::new(class_name, member_name))
    }

    /// Look up a member by a qualified `Class.method` string.
    pub fn lookup_qualified(&self, qualified: &str) -> Option<&MemberInfo> {
        let (class_name, member_name) = qualified.split_once('.')?;
        self.lookup(class_name, member_name)
    }

    /// Look up the constructor of a class (named after the class).
    pub fn constructor(&self, class_name: &str) -> Option<&MemberInfo> {
        self.lookup(class_name, class_name)
            .filter(|m| m.is_constructor())
    }

    /// The declared fields of a class.
    pub fn fields(&self, class_name: &str) -> Option<&[(Identifier, NonVoidType)]> {
        self.classes.get(class_name).map(|c| c.fields.as_slice())
    }

    /// Whether a name denotes a class (used to distinguish static calls
    /// from instance calls on a variable).
    pub fn is_class(&self, name: &str) -> bool {
        self.classes.contains_key(name)
    }

    pub fn members(&self) -> impl Iterator<Item = (&MemberRef, &MemberInfo)> {
        self.members.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build;
    use oox_syntax::parse;

    #[test]
    fn test_lookup_qualified() {
        let unit = parse(
            "class Main {
                static void main() { skip; }
            }",
        )
        .expect("parse");
        let (_, symbols) = build(&unit).expect("cfg");
        assert!(symbols.lookup_qualified("Main.main").is_some());
        assert!(symbols.lookup_qualified("Main.other").is_none());
        assert!(symbols.lookup_qualified("nodot").is_none());
    }

    #[test]
    fn test_constructor_lookup() {
        let unit = parse(
            "class Node {
                int value;
                Node(int v) { this.value := v; }
            }",
        )
        .expect("parse");
        let (_, symbols) = build(&unit).expect("cfg");
        let ctor = symbols.constructor("Node").expect("constructor");
        assert!(ctor.is_constructor());
        assert_eq!(symbols.fields("Node").unwrap().len(), 1);
        assert!(symbols.is_class("Node"));
        assert!(!symbols.is_class("value"));
    }
}
