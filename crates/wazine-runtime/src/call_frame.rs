//! The three-slot call frame embedded in the value stack at every call
//! boundary. Field order and size mirror `wazine_types::layout::call_frame`
//! exactly — generated code writes and reads these fields by raw offset.

use wazine_types::layout::call_frame;

/// A call frame as read back from the value stack during a backtrace walk
/// or a return sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallFrame {
    pub return_address: u64,
    pub caller_stack_base_pointer: u32,
    /// Function pointer (as a raw code address) of the caller's own
    /// function, used to resolve the caller's debug name during a
    /// backtrace walk without carrying a separate index.
    pub caller_function_ptr: u64,
}

impl CallFrame {
    /// The zero frame written for the outermost (host) caller: its presence
    /// signals "there is no WebAssembly caller above this one" to the
    /// backtrace builder.
    pub const ROOT: CallFrame = CallFrame { return_address: 0, caller_stack_base_pointer: 0, caller_function_ptr: 0 };

    pub fn is_root(&self) -> bool {
        *self == Self::ROOT
    }

    /// Read a frame embedded at `base` (slot index) in `stack`.
    pub fn read(stack: &[u64], base: u32) -> CallFrame {
        let idx = base as usize;
        CallFrame {
            return_address: stack[idx + call_frame::RETURN_ADDRESS / 8],
            caller_stack_base_pointer: stack[idx + call_frame::CALLER_STACK_BASE_POINTER / 8] as u32,
            caller_function_ptr: stack[idx + call_frame::CALLER_FUNCTION_PTR / 8],
        }
    }

    /// Write this frame at `base` (slot index) in `stack`.
    pub fn write(&self, stack: &mut [u64], base: u32) {
        let idx = base as usize;
        stack[idx + call_frame::RETURN_ADDRESS / 8] = self.return_address;
        stack[idx + call_frame::CALLER_STACK_BASE_POINTER / 8] = self.caller_stack_base_pointer as u64;
        stack[idx + call_frame::CALLER_FUNCTION_PTR / 8] = self.caller_function_ptr;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_a_slot_buffer() {
        let mut stack = vec![0u64; 8];
        let frame = CallFrame { return_address: 0x1000, caller_stack_base_pointer: 4, caller_function_ptr: 0x2000 };
        frame.write(&mut stack, 0);
        assert_eq!(CallFrame::read(&stack, 0), frame);
    }

    #[test]
    fn root_frame_is_recognizable() {
        let stack = vec![0u64; 8];
        assert!(CallFrame::read(&stack, 0).is_root());
    }
}
