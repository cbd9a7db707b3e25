//! The lexical scope chain the evaluator resolves identifiers against:
//! the current type's children (mutable, for instance memoization),
//! `_parent`/`_root` reached by walking the chain, and the enclosing
//! type's `instances` map for on-demand evaluation.

use std::cell::RefCell;
use std::rc::Rc;

use crate::schema::UserType;
use crate::value::Node;

#[derive(Clone)]
pub struct Scope<'a> {
    pub node: Rc<RefCell<Node>>,
    pub user_type: &'a UserType,
    pub parent: Option<Rc<Scope<'a>>>,
    pub root: Rc<RefCell<Node>>,
}

impl<'a> Scope<'a> {
    pub fn root_scope(node: Rc<RefCell<Node>>, user_type: &'a UserType) -> Scope<'a> {
        Scope {
            node: node.clone(),
            user_type,
            parent: None,
            root: node,
        }
    }

    pub fn child(parent: &Rc<Scope<'a>>, node: Rc<RefCell<Node>>, user_type: &'a UserType) -> Scope<'a> {
        Scope {
            node,
            user_type,
            parent: Some(parent.clone()),
            root: parent.root.clone(),
        }
    }
}
