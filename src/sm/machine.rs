//! Construction-time validation and the step loop.

use std::collections::HashMap;
use std::sync::Arc;

use crate::dv::{DataVector, DvElem, ElemType};
use crate::errors::Error;
use crate::sm::{ActionBatch, CompareOp, SmState, StateConfig, Transition, TypedValue};

struct StateData {
    actions: Vec<ActionBatch>,
    transitions: Vec<Transition>,
}

/// The state machine proper.
pub struct StateMachine {
    dv: Arc<DataVector>,
    state_elem: DvElem,
    states: HashMap<SmState, StateData>,
    current: SmState,
    entered_at_ns: u64,
    last_step_ns: u64,
    /// Index of the next unexecuted action batch of the current state.
    cursor: usize,
}

impl StateMachine {
    /// Build and validate a machine.
    ///
    /// The initial state is whatever the Data Vector's state element holds;
    /// `now_ns` becomes its entry time, so bring the machine up immediately
    /// before the periodic loop starts counting.
    pub fn new(
        config: &[StateConfig],
        dv: Arc<DataVector>,
        now_ns: u64,
        state_elem: DvElem,
    ) -> Result<StateMachine, Error> {
        if config.is_empty() {
            return Err(Error::NoStates);
        }

        dv.element_exists(state_elem)?;
        if dv.elem_type(state_elem)? != ElemType::U32 {
            return Err(Error::TypeMismatch);
        }

        let mut states = HashMap::new();
        for state in config {
            if states.contains_key(&state.id) {
                return Err(Error::InvalidConfig);
            }
            states.insert(
                state.id,
                StateData {
                    actions: state.actions.clone(),
                    transitions: state.transitions.clone(),
                },
            );
        }

        for state in config {
            for transition in &state.transitions {
                if !states.contains_key(&transition.target) {
                    return Err(Error::InvalidTransition);
                }
                validate_operand(&dv, transition.elem, transition.value)?;
                if transition.value.elem_type() == ElemType::Bool
                    && !matches!(transition.op, CompareOp::Eq | CompareOp::Ne)
                {
                    return Err(Error::InvalidConfig);
                }
            }
            for batch in &state.actions {
                for action in &batch.actions {
                    // The state element changes through transitions only.
                    if action.elem == state_elem {
                        return Err(Error::InvalidConfig);
                    }
                    validate_operand(&dv, action.elem, action.value)?;
                }
            }
        }

        let raw_state: u32 = dv.read(state_elem)?;
        let current = SmState::from_raw(raw_state)
            .filter(|state| states.contains_key(state))
            .ok_or(Error::StateNotFound)?;

        Ok(StateMachine {
            dv,
            state_elem,
            states,
            current,
            entered_at_ns: now_ns,
            last_step_ns: now_ns,
            cursor: 0,
        })
    }

    /// One evaluation of "transitions first, then due action batches".
    ///
    /// When a transition fires the step ends there: the new state's entry
    /// time becomes `now_ns`, the action cursor resets, and no actions of
    /// either state execute this tick; a transition triggered by the
    /// previous tick's actions gets priority over new writes.
    pub fn step(&mut self, now_ns: u64) -> Result<(), Error> {
        if now_ns < self.last_step_ns {
            return Err(Error::InvalidTime);
        }
        self.last_step_ns = now_ns;

        let state = &self.states[&self.current];
        for transition in &state.transitions {
            if self.guard_holds(transition)? {
                let target = transition.target;
                self.dv.write(self.state_elem, target as u32)?;
                self.current = target;
                self.entered_at_ns = now_ns;
                self.cursor = 0;
                return Ok(());
            }
        }

        let elapsed = now_ns - self.entered_at_ns;
        let batches = &self.states[&self.current].actions;
        while self.cursor < batches.len() && batches[self.cursor].offset_ns <= elapsed {
            for action in &batches[self.cursor].actions {
                self.apply(action.elem, action.value)?;
            }
            self.cursor += 1;
        }

        Ok(())
    }

    /// Jump to a state regardless of guards. Test injection only.
    pub fn force_switch(&mut self, target: SmState, now_ns: u64) -> Result<(), Error> {
        if !self.states.contains_key(&target) {
            return Err(Error::StateNotFound);
        }
        self.dv.write(self.state_elem, target as u32)?;
        self.current = target;
        self.entered_at_ns = now_ns;
        self.last_step_ns = now_ns;
        self.cursor = 0;
        Ok(())
    }

    /// The state the machine is currently in.
    pub fn current_state(&self) -> SmState {
        self.current
    }

    fn guard_holds(&self, transition: &Transition) -> Result<bool, Error> {
        let op = transition.op;
        Ok(match transition.value {
            TypedValue::U8(v) => compare(self.dv.read::<u8>(transition.elem)?, op, v),
            TypedValue::U16(v) => compare(self.dv.read::<u16>(transition.elem)?, op, v),
            TypedValue::U32(v) => compare(self.dv.read::<u32>(transition.elem)?, op, v),
            TypedValue::U64(v) => compare(self.dv.read::<u64>(transition.elem)?, op, v),
            TypedValue::I8(v) => compare(self.dv.read::<i8>(transition.elem)?, op, v),
            TypedValue::I16(v) => compare(self.dv.read::<i16>(transition.elem)?, op, v),
            TypedValue::I32(v) => compare(self.dv.read::<i32>(transition.elem)?, op, v),
            TypedValue::I64(v) => compare(self.dv.read::<i64>(transition.elem)?, op, v),
            TypedValue::F32(v) => compare(self.dv.read::<f32>(transition.elem)?, op, v),
            TypedValue::F64(v) => compare(self.dv.read::<f64>(transition.elem)?, op, v),
            TypedValue::Bool(v) => compare(self.dv.read::<bool>(transition.elem)?, op, v),
        })
    }

    fn apply(&self, elem: DvElem, value: TypedValue) -> Result<(), Error> {
        match value {
            TypedValue::U8(v) => self.dv.write(elem, v),
            TypedValue::U16(v) => self.dv.write(elem, v),
            TypedValue::U32(v) => self.dv.write(elem, v),
            TypedValue::U64(v) => self.dv.write(elem, v),
            TypedValue::I8(v) => self.dv.write(elem, v),
            TypedValue::I16(v) => self.dv.write(elem, v),
            TypedValue::I32(v) => self.dv.write(elem, v),
            TypedValue::I64(v) => self.dv.write(elem, v),
            TypedValue::F32(v) => self.dv.write(elem, v),
            TypedValue::F64(v) => self.dv.write(elem, v),
            TypedValue::Bool(v) => self.dv.write(elem, v),
        }
    }
}

fn validate_operand(dv: &DataVector, elem: DvElem, value: TypedValue) -> Result<(), Error> {
    dv.element_exists(elem)?;
    if dv.elem_type(elem)? != value.elem_type() {
        return Err(Error::TypeMismatch);
    }
    Ok(())
}

fn compare<T: PartialOrd>(lhs: T, op: CompareOp, rhs: T) -> bool {
    match op {
        CompareOp::Eq => lhs == rhs,
        CompareOp::Ne => lhs != rhs,
        CompareOp::Lt => lhs < rhs,
        CompareOp::Le => lhs <= rhs,
        CompareOp::Gt => lhs > rhs,
        CompareOp::Ge => lhs >= rhs,
    }
}
