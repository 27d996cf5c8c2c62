//! Virtual register allocation with LRU spilling.
//!
//! Two independent banks exist per function: general-purpose variables
//! live in `r1..r5` with temporaries `r6`/`r7`, float variables in
//! `xmm0..xmm5` with temporaries `xmm6`/`xmm7`. Spill slots are handed
//! out by a per-function [`FrameSlots`] counter shared between both
//! banks and array allocations, so reload addresses stay stable for the
//! whole function.

use std::collections::{HashMap, HashSet};
use std::mem;

use aurora_asm::{op, Instruction, RegisterId, REG_TMP0, REG_TMP1, REG_VAR_FIRST, REG_VAR_LAST,
    XMM_TMP0, XMM_TMP1, XMM_VAR_FIRST, XMM_VAR_LAST};

use crate::error::CompileError;

/// Monotonic spill-slot counter for one function frame.
#[derive(Debug, Default)]
pub struct FrameSlots {
    next: u32,
}

impl FrameSlots {
    /// A fresh counter starting at slot zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves one slot.
    pub fn reserve(&mut self) -> u32 {
        self.reserve_block(1)
    }

    /// Reserves `count` contiguous slots, returning the base slot.
    pub fn reserve_block(&mut self, count: u32) -> u32 {
        let base = self.next;
        self.next += count;
        base
    }

    /// Number of slots handed out so far.
    pub fn count(&self) -> u32 {
        self.next
    }

    /// Forgets all slots at a function boundary.
    pub fn reset(&mut self) {
        self.next = 0;
    }
}

/// One register bank with its allocation state.
#[derive(Debug)]
pub struct RegisterFile {
    float_bank: bool,
    first: RegisterId,
    last: RegisterId,
    temps: [RegisterId; 2],
    temp_in_use: [bool; 2],
    var_to_reg: HashMap<String, RegisterId>,
    reg_to_var: HashMap<RegisterId, String>,
    var_to_slot: HashMap<String, u32>,
    initialized: HashSet<String>,
    on_stack: HashSet<String>,
    // Least recently used first.
    access_order: Vec<String>,
    spills: Vec<Instruction>,
}

impl RegisterFile {
    /// The general-purpose bank (`r1..r5`, temps `r6`/`r7`).
    pub fn gp() -> Self {
        Self::new(false, REG_VAR_FIRST, REG_VAR_LAST, [REG_TMP0, REG_TMP1])
    }

    /// The float bank (`xmm0..xmm5`, temps `xmm6`/`xmm7`).
    pub fn xmm() -> Self {
        Self::new(true, XMM_VAR_FIRST, XMM_VAR_LAST, [XMM_TMP0, XMM_TMP1])
    }

    fn new(float_bank: bool, first: RegisterId, last: RegisterId, temps: [RegisterId; 2]) -> Self {
        Self {
            float_bank,
            first,
            last,
            temps,
            temp_in_use: [false; 2],
            var_to_reg: HashMap::new(),
            reg_to_var: HashMap::new(),
            var_to_slot: HashMap::new(),
            initialized: HashSet::new(),
            on_stack: HashSet::new(),
            access_order: Vec::new(),
            spills: Vec::new(),
        }
    }

    /// Clears all state at a function boundary.
    pub fn reset(&mut self) {
        self.temp_in_use = [false; 2];
        self.var_to_reg.clear();
        self.reg_to_var.clear();
        self.var_to_slot.clear();
        self.initialized.clear();
        self.on_stack.clear();
        self.access_order.clear();
        self.spills.clear();
    }

    /// Pre-assigns a parameter to its calling-convention register.
    pub fn bind(&mut self, name: &str, reg: RegisterId) {
        self.var_to_reg.insert(name.to_owned(), reg);
        self.reg_to_var.insert(reg, name.to_owned());
        self.initialized.insert(name.to_owned());
        self.touch(name);
    }

    /// A register for writing `name`; the current value, if any, is
    /// irrelevant, so spilled variables re-bind without a reload.
    pub fn allocate_variable(
        &mut self,
        name: &str,
        frame: &mut FrameSlots,
    ) -> Result<RegisterId, CompileError> {
        if let Some(&reg) = self.var_to_reg.get(name) {
            self.touch(name);
            return Ok(reg);
        }
        self.on_stack.remove(name);
        let reg = match self.free_register() {
            Some(reg) => reg,
            None => self.evict(frame, Some(name), false)?,
        };
        self.var_to_reg.insert(name.to_owned(), reg);
        self.reg_to_var.insert(reg, name.to_owned());
        self.touch(name);
        Ok(reg)
    }

    /// The register currently holding `name`, reloading it from its
    /// spill slot when necessary.
    pub fn get_variable(
        &mut self,
        name: &str,
        frame: &mut FrameSlots,
    ) -> Result<RegisterId, CompileError> {
        if let Some(&reg) = self.var_to_reg.get(name) {
            self.touch(name);
            return Ok(reg);
        }
        if !self.on_stack.contains(name) {
            return Err(CompileError::Allocation(format!(
                "variable `{name}` is neither in a register nor on the stack"
            )));
        }
        let reg = match self.free_register() {
            Some(reg) => reg,
            None => self.evict(frame, Some(name), true)?,
        };
        let slot = self.var_to_slot[name];
        self.spills.push(self.reload_instr(reg, slot));
        self.on_stack.remove(name);
        self.var_to_reg.insert(name.to_owned(), reg);
        self.reg_to_var.insert(reg, name.to_owned());
        self.touch(name);
        Ok(reg)
    }

    /// Marks `name` as carrying a live value, making it spillable.
    pub fn mark_initialized(&mut self, name: &str) {
        self.initialized.insert(name.to_owned());
    }

    /// Whether `name` currently occupies a register.
    pub fn in_register(&self, name: &str) -> bool {
        self.var_to_reg.contains_key(name)
    }

    /// Claims an expression temporary.
    pub fn allocate_temp(&mut self) -> Result<RegisterId, CompileError> {
        for (idx, reg) in self.temps.into_iter().enumerate() {
            if !self.temp_in_use[idx] {
                self.temp_in_use[idx] = true;
                return Ok(reg);
            }
        }
        Err(CompileError::Allocation(
            "expression too deeply nested: no temporary register available".into(),
        ))
    }

    /// Releases an expression temporary.
    pub fn release_temp(&mut self, reg: RegisterId) {
        for (idx, temp) in self.temps.into_iter().enumerate() {
            if temp == reg {
                self.temp_in_use[idx] = false;
            }
        }
    }

    /// Temporaries currently claimed, for saving around calls.
    pub fn temps_in_use(&self) -> Vec<RegisterId> {
        self.temps
            .into_iter()
            .enumerate()
            .filter(|(idx, _)| self.temp_in_use[*idx])
            .map(|(_, reg)| reg)
            .collect()
    }

    /// Spills every initialized variable to its slot and drops the
    /// rest, freeing the whole bank (used before calls).
    pub fn spill_all(&mut self, frame: &mut FrameSlots) {
        let names: Vec<String> = self.access_order.clone();
        for name in names {
            if !self.var_to_reg.contains_key(&name) {
                continue;
            }
            self.spill_one(&name, frame);
        }
    }

    /// Queued spill/reload instructions, drained by the code generator
    /// before it emits the instruction that needed them.
    pub fn take_spills(&mut self) -> Vec<Instruction> {
        mem::take(&mut self.spills)
    }

    /// The spill slot assigned to `name`, if any.
    pub fn slot_of(&self, name: &str) -> Option<u32> {
        self.var_to_slot.get(name).copied()
    }

    fn spill_one(&mut self, name: &str, frame: &mut FrameSlots) {
        let reg = self.var_to_reg[name];
        if self.initialized.contains(name) {
            let slot = match self.var_to_slot.get(name) {
                Some(&slot) => slot,
                None => {
                    let slot = frame.reserve();
                    self.var_to_slot.insert(name.to_owned(), slot);
                    slot
                }
            };
            self.spills.push(self.spill_instr(slot, reg));
            self.on_stack.insert(name.to_owned());
        }
        self.var_to_reg.remove(name);
        self.reg_to_var.remove(&reg);
        self.access_order.retain(|n| n != name);
    }

    fn spill_instr(&self, slot: u32, reg: RegisterId) -> Instruction {
        if self.float_bank {
            op::store_stack_f(slot, reg)
        } else {
            op::store_stack(slot, reg)
        }
    }

    fn reload_instr(&self, reg: RegisterId, slot: u32) -> Instruction {
        if self.float_bank {
            op::load_stack_f(reg, slot)
        } else {
            op::load_stack(reg, slot)
        }
    }

    fn touch(&mut self, name: &str) {
        self.access_order.retain(|n| n != name);
        self.access_order.push(name.to_owned());
    }

    fn free_register(&self) -> Option<RegisterId> {
        (self.first..=self.last).find(|reg| !self.reg_to_var.contains_key(reg))
    }

    /// Frees a register by evicting a victim variable.
    ///
    /// Writes prefer the least recently used initialized variable
    /// (falling back to any); reloads prefer uninitialized victims so a
    /// store can be skipped. `protect` is never chosen.
    fn evict(
        &mut self,
        frame: &mut FrameSlots,
        protect: Option<&str>,
        prefer_uninitialized: bool,
    ) -> Result<RegisterId, CompileError> {
        let candidates: Vec<String> = self
            .access_order
            .iter()
            .filter(|name| self.var_to_reg.contains_key(*name))
            .filter(|name| Some(name.as_str()) != protect)
            .cloned()
            .collect();

        let victim = if prefer_uninitialized {
            candidates
                .iter()
                .find(|name| !self.initialized.contains(*name))
                .or_else(|| candidates.first())
        } else {
            candidates
                .iter()
                .find(|name| self.initialized.contains(*name))
                .or_else(|| candidates.first())
        };

        let victim = victim
            .cloned()
            .ok_or_else(|| CompileError::Allocation("no evictable register".into()))?;
        let reg = self.var_to_reg[&victim];
        self.spill_one(&victim, frame);
        Ok(reg)
    }
}

#[cfg(test)]
mod tests {
    use aurora_asm::Opcode;

    use super::*;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("v{i}")).collect()
    }

    #[test]
    fn variables_get_distinct_registers() {
        let mut frame = FrameSlots::new();
        let mut bank = RegisterFile::gp();
        let mut seen = HashSet::new();
        for name in names(5) {
            let reg = bank.allocate_variable(&name, &mut frame).unwrap();
            bank.mark_initialized(&name);
            assert!(seen.insert(reg), "register {reg} handed out twice");
        }
        assert!(bank.take_spills().is_empty());
    }

    #[test]
    fn lru_initialized_variable_is_evicted_first() {
        let mut frame = FrameSlots::new();
        let mut bank = RegisterFile::gp();
        for name in names(5) {
            bank.allocate_variable(&name, &mut frame).unwrap();
            bank.mark_initialized(&name);
        }
        // v0 is the least recently used; touching it moves v1 to the front.
        bank.get_variable("v0", &mut frame).unwrap();

        bank.allocate_variable("v5", &mut frame).unwrap();
        let spills = bank.take_spills();
        assert_eq!(spills.len(), 1);
        assert_eq!(spills[0].opcode(), Opcode::STORE_STACK);
        assert!(!bank.in_register("v1"));
        assert!(bank.in_register("v0"));
    }

    #[test]
    fn uninitialized_variables_are_dropped_silently() {
        let mut frame = FrameSlots::new();
        let mut bank = RegisterFile::gp();
        for name in names(5) {
            bank.allocate_variable(&name, &mut frame).unwrap();
            if name != "v0" {
                bank.mark_initialized(&name);
            }
        }
        // v0 never carried a value, so flushing drops it without a store.
        bank.spill_all(&mut frame);
        let stores = bank.take_spills();
        assert_eq!(stores.len(), 4);
        assert_eq!(frame.count(), 4);
    }

    #[test]
    fn spill_slots_are_stable_across_evictions() {
        let mut frame = FrameSlots::new();
        let mut bank = RegisterFile::gp();
        for name in names(5) {
            bank.allocate_variable(&name, &mut frame).unwrap();
            bank.mark_initialized(&name);
        }
        bank.allocate_variable("v5", &mut frame).unwrap();
        bank.mark_initialized("v5");
        bank.take_spills();
        let first_slot = bank.slot_of("v0").unwrap();

        // Reload v0 (evicting someone else), then evict it again.
        bank.get_variable("v0", &mut frame).unwrap();
        bank.spill_all(&mut frame);
        assert_eq!(bank.slot_of("v0"), Some(first_slot));
    }

    #[test]
    fn reload_restores_from_the_assigned_slot() {
        let mut frame = FrameSlots::new();
        let mut bank = RegisterFile::gp();
        bank.allocate_variable("v", &mut frame).unwrap();
        bank.mark_initialized("v");
        bank.spill_all(&mut frame);
        let spills = bank.take_spills();
        assert_eq!(spills.len(), 1);
        let slot = spills[0].imm();

        let reg = bank.get_variable("v", &mut frame).unwrap();
        let reloads = bank.take_spills();
        assert_eq!(reloads.len(), 1);
        assert_eq!(reloads[0].opcode(), Opcode::LOAD_STACK);
        assert_eq!(reloads[0].imm(), slot);
        assert_eq!(reloads[0].a(), reg);
    }

    #[test]
    fn float_bank_spills_use_the_float_form() {
        let mut frame = FrameSlots::new();
        let mut bank = RegisterFile::xmm();
        bank.allocate_variable("x", &mut frame).unwrap();
        bank.mark_initialized("x");
        bank.spill_all(&mut frame);
        let spills = bank.take_spills();
        assert_eq!(spills[0].c(), aurora_asm::consts::FLOAT_BANK);
    }

    #[test]
    fn temp_pair_exhaustion_is_an_error() {
        let mut bank = RegisterFile::gp();
        let t0 = bank.allocate_temp().unwrap();
        let t1 = bank.allocate_temp().unwrap();
        assert_ne!(t0, t1);
        assert!(matches!(
            bank.allocate_temp(),
            Err(CompileError::Allocation(_))
        ));
        bank.release_temp(t0);
        assert_eq!(bank.allocate_temp().unwrap(), t0);
    }

    mod props {
        use quickcheck_macros::quickcheck;

        use super::*;

        #[derive(Debug, Clone)]
        enum Op {
            Allocate(u8),
            Get(u8),
            Init(u8),
            SpillAll,
        }

        impl quickcheck::Arbitrary for Op {
            fn arbitrary(g: &mut quickcheck::Gen) -> Self {
                let var = u8::arbitrary(g) % 8;
                match u8::arbitrary(g) % 4 {
                    0 => Op::Allocate(var),
                    1 => Op::Get(var),
                    2 => Op::Init(var),
                    _ => Op::SpillAll,
                }
            }
        }

        /// After any operation sequence the maps stay inverse of each
        /// other and no variable is both spilled and register-resident.
        #[quickcheck]
        fn maps_stay_inverse(ops: Vec<Op>) -> bool {
            let mut frame = FrameSlots::new();
            let mut bank = RegisterFile::gp();
            let mut allocated: HashSet<String> = HashSet::new();

            for op in ops {
                match op {
                    Op::Allocate(v) => {
                        let name = format!("v{v}");
                        if bank.allocate_variable(&name, &mut frame).is_err() {
                            return false;
                        }
                        allocated.insert(name);
                    }
                    Op::Get(v) => {
                        let name = format!("v{v}");
                        // Only meaningful for live variables.
                        if allocated.contains(&name) {
                            let on_stack_or_reg =
                                bank.in_register(&name) || bank.slot_of(&name).is_some();
                            if on_stack_or_reg && bank.get_variable(&name, &mut frame).is_err() {
                                return false;
                            }
                        }
                    }
                    Op::Init(v) => {
                        let name = format!("v{v}");
                        if allocated.contains(&name) && bank.in_register(&name) {
                            bank.mark_initialized(&name);
                        }
                    }
                    Op::SpillAll => bank.spill_all(&mut frame),
                }

                for (var, reg) in &bank.var_to_reg {
                    if bank.reg_to_var.get(reg) != Some(var) {
                        return false;
                    }
                    if bank.on_stack.contains(var) {
                        return false;
                    }
                }
                for (reg, var) in &bank.reg_to_var {
                    if bank.var_to_reg.get(var) != Some(reg) {
                        return false;
                    }
                }
            }
            true
        }
    }
}
